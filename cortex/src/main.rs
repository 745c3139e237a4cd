//! Motor cortex CLI.
//!
//! Starts runs, delivers human answers and approvals to paused runs, retries
//! failed runs and inspects the run store. Configuration comes from
//! `cortex.toml` (defaults apply when it is missing).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::json;

use cortex::attempt::{AttemptOutcome, CancelToken, LoopConfig, LoopDeps, TaskRequest, start_run};
use cortex::core::credentials::CredentialStore;
use cortex::core::resume::ResumeInput;
use cortex::core::types::RunStatus;
use cortex::exit_codes;
use cortex::io::config::{CortexConfig, load_config, write_config};
use cortex::io::model::CommandBackend;
use cortex::io::secrets::load_credentials;
use cortex::io::signals::{FanoutSink, JsonlSink, LogSink};
use cortex::io::state_store::{FileStateStore, RunFilter, StateStore};
use cortex::io::tools::{CommandFetcher, CommandSearch, Fetcher, WebSearch};
use cortex::logging;
use cortex::resume::{continue_run, resume_run, retry_run};
use cortex::run::Run;

#[derive(Parser)]
#[command(
    name = "cortex",
    version,
    about = "Sandboxed, resumable execution runtime for delegated agent tasks"
)]
struct Cli {
    /// Path to the runtime configuration.
    #[arg(long, global = true, default_value = "cortex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `cortex.toml` if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a run and drive its first attempt.
    Run {
        #[arg(long)]
        task: String,
        /// Tool to grant; repeat for several.
        #[arg(long = "tool")]
        tools: Vec<String>,
        /// Allowed network domain; repeat for several. Omit for no restriction.
        #[arg(long = "domain")]
        domains: Vec<String>,
    },
    /// Answer or approve a paused run and continue it.
    #[command(group(ArgGroup::new("input").required(true).args(["answer", "approve", "deny"])))]
    Resume {
        run_id: String,
        #[arg(long)]
        answer: Option<String>,
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        deny: bool,
        /// Note attached to an approval decision.
        #[arg(long)]
        note: Option<String>,
        /// Only resume if this tool call is still the pending one.
        #[arg(long)]
        call_id: Option<String>,
    },
    /// Continue a run left running by an interrupted process.
    Continue { run_id: String },
    /// Start a new attempt of a failed run.
    Retry {
        run_id: String,
        /// Guidance for the new attempt; defaults to the failure hint.
        #[arg(long)]
        guidance: Option<String>,
    },
    /// List runs, newest first.
    List {
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print a run record as JSON.
    Show { run_id: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            task,
            tools,
            domains,
        } => {
            let runtime = Runtime::load(&cli.config)?;
            let request = TaskRequest {
                task,
                tools,
                domains: (!domains.is_empty()).then_some(domains),
            };
            let (run, outcome) = start_run(
                request,
                &runtime.deps(),
                &runtime.loop_cfg,
                &CancelToken::new(),
            )?;
            Ok(report(&run, &outcome))
        }
        Command::Resume {
            run_id,
            answer,
            approve,
            deny,
            note,
            call_id,
        } => {
            let input = match answer {
                Some(answer) => ResumeInput::Answer(answer),
                None if approve || deny => ResumeInput::Approval {
                    approved: approve,
                    note,
                },
                None => bail!("one of --answer, --approve or --deny is required"),
            };
            let runtime = Runtime::load(&cli.config)?;
            let (run, outcome) = resume_run(
                &run_id,
                &input,
                call_id.as_deref(),
                &runtime.deps(),
                &runtime.loop_cfg,
                &CancelToken::new(),
            )?;
            match outcome {
                Some(outcome) => Ok(report(&run, &outcome)),
                None => {
                    print_json(&json!({
                        "run_id": run.id,
                        "status": run.status,
                        "resumed": false,
                    }))?;
                    Ok(status_exit_code(run.status))
                }
            }
        }
        Command::Continue { run_id } => {
            let runtime = Runtime::load(&cli.config)?;
            let (run, outcome) = continue_run(
                &run_id,
                &runtime.deps(),
                &runtime.loop_cfg,
                &CancelToken::new(),
            )?;
            Ok(report(&run, &outcome))
        }
        Command::Retry { run_id, guidance } => {
            let runtime = Runtime::load(&cli.config)?;
            let (run, outcome) = retry_run(
                &run_id,
                guidance,
                &runtime.deps(),
                &runtime.loop_cfg,
                &CancelToken::new(),
            )?;
            Ok(report(&run, &outcome))
        }
        Command::List { status, limit } => {
            let cfg = load_config(&cli.config)?;
            let store = FileStateStore::new(&cfg.state_dir);
            for run in store.list_runs(&RunFilter { status, limit })? {
                println!(
                    "{}\t{}\t{}\t{}",
                    run.id,
                    run.status,
                    run.created_at.to_rfc3339(),
                    first_line(&run.task)
                );
            }
            Ok(exit_codes::OK)
        }
        Command::Show { run_id } => {
            let cfg = load_config(&cli.config)?;
            let store = FileStateStore::new(&cfg.state_dir);
            let run = store
                .get_run(&run_id)?
                .with_context(|| format!("run {run_id} not found"))?;
            print_json(&run)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &CortexConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

const MODEL_OUTPUT_LIMIT_BYTES: usize = 8 << 20;

/// Everything a loop invocation needs, built from config.
struct Runtime {
    cfg: CortexConfig,
    loop_cfg: LoopConfig,
    model: CommandBackend,
    store: FileStateStore,
    sink: FanoutSink,
    credentials: CredentialStore,
}

impl Runtime {
    fn load(config_path: &Path) -> Result<Self> {
        let cfg = load_config(config_path)?;
        let model = CommandBackend::new(
            cfg.model_command()?.to_vec(),
            Duration::from_secs(cfg.model.timeout_secs),
            MODEL_OUTPUT_LIMIT_BYTES,
        );
        let credentials = load_credentials(cfg.credentials_file.as_deref())?;
        Ok(Self {
            loop_cfg: LoopConfig::from_config(&cfg),
            model,
            store: FileStateStore::new(&cfg.state_dir),
            sink: FanoutSink::new(vec![
                Box::new(LogSink),
                Box::new(JsonlSink::new(cfg.events_path.clone())),
            ]),
            credentials,
            cfg,
        })
    }

    fn deps(&self) -> LoopDeps<'_> {
        let limits = self.cfg.tools.limits();
        let mut deps = LoopDeps::new(&self.model, &self.store, &self.sink, &self.credentials);
        if !self.cfg.network.fetch_command.is_empty() {
            let fetcher: Arc<dyn Fetcher> = Arc::new(CommandFetcher::new(
                self.cfg.network.fetch_command.clone(),
                limits.timeout,
                limits.output_limit_bytes,
            ));
            deps.fetcher = Some(fetcher);
        }
        if !self.cfg.network.search_command.is_empty() {
            let searcher: Arc<dyn WebSearch> = Arc::new(CommandSearch::new(
                self.cfg.network.search_command.clone(),
                limits.timeout,
                limits.output_limit_bytes,
            ));
            deps.searcher = Some(searcher);
        }
        deps
    }
}

/// Print the outcome as JSON and map it to an exit code.
fn report(run: &Run, outcome: &AttemptOutcome) -> i32 {
    let body = match outcome {
        AttemptOutcome::Completed(result) => json!({
            "run_id": run.id,
            "status": run.status,
            "result": result,
            "energy_consumed": run.energy_consumed,
        }),
        AttemptOutcome::Paused(_) => {
            let attempt = run.current_attempt();
            json!({
                "run_id": run.id,
                "status": run.status,
                "pending_tool_call_id": attempt.and_then(|a| a.pending_tool_call_id.as_deref()),
                "question": attempt.and_then(|a| a.pending_question.as_deref()),
                "approval": attempt.and_then(|a| a.pending_approval.as_ref()),
            })
        }
        AttemptOutcome::Failed(failure) => json!({
            "run_id": run.id,
            "status": run.status,
            "attempt": run.current_attempt_index,
            "attempts_left": run.max_attempts.saturating_sub(run.attempts.len() as u32),
            "failure": failure,
        }),
    };
    if let Err(err) = print_json(&body) {
        eprintln!("{:#}", err);
        return exit_codes::INVALID;
    }
    status_exit_code(run.status)
}

fn status_exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed | RunStatus::Created | RunStatus::Running => exit_codes::OK,
        RunStatus::AwaitingInput | RunStatus::AwaitingApproval => exit_codes::AWAITING,
        RunStatus::Failed => exit_codes::FAILED,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_repeated_grants() {
        let cli = Cli::parse_from([
            "cortex",
            "run",
            "--task",
            "summarize",
            "--tool",
            "read_file",
            "--tool",
            "grep",
            "--domain",
            "example.com",
        ]);
        match cli.command {
            Command::Run {
                task,
                tools,
                domains,
            } => {
                assert_eq!(task, "summarize");
                assert_eq!(tools, vec!["read_file", "grep"]);
                assert_eq!(domains, vec!["example.com"]);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from("cortex.toml"));
    }

    #[test]
    fn resume_requires_exactly_one_input() {
        assert!(Cli::try_parse_from(["cortex", "resume", "run_1"]).is_err());
        assert!(
            Cli::try_parse_from(["cortex", "resume", "run_1", "--answer", "a", "--approve"])
                .is_err()
        );
        let cli = Cli::try_parse_from(["cortex", "resume", "run_1", "--deny", "--note", "no"])
            .expect("parse");
        assert!(matches!(cli.command, Command::Resume { deny: true, .. }));
    }

    #[test]
    fn list_parses_status_filter() {
        let cli = Cli::parse_from(["cortex", "list", "--status", "awaiting_input"]);
        assert!(matches!(
            cli.command,
            Command::List {
                status: Some(RunStatus::AwaitingInput),
                limit: None
            }
        ));
    }

    #[test]
    fn paused_and_failed_statuses_have_distinct_exit_codes() {
        assert_eq!(status_exit_code(RunStatus::Completed), exit_codes::OK);
        assert_eq!(status_exit_code(RunStatus::AwaitingApproval), exit_codes::AWAITING);
        assert_eq!(status_exit_code(RunStatus::Failed), exit_codes::FAILED);
    }
}
