//! Orchestration for one attempt of a run.
//!
//! [`run_attempt`] drives the current attempt from its `step_cursor` until it
//! completes, fails or pauses for a human. Every iteration is persisted before
//! the next one starts, so a crashed process or a paused attempt picks up at
//! exactly the next unexecuted step.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{TriggerError, classify};
use crate::core::completion::{StopKind, classify_stop};
use crate::core::credentials::{
    CredentialStore, Redactor, missing_credentials_message, placeholder_names,
    resolve_placeholders,
};
use crate::core::failure_tracker::record_outcome;
use crate::core::tool_args::{ToolArgs, ToolName, ToolSchema, schemas_for};
use crate::core::types::{
    AttemptStatus, ErrorCode, FailureCategory, FailureSummary, TaskResult, ToolResult,
};
use crate::io::artifacts::{extract_skills, persist_artifacts};
use crate::io::config::CortexConfig;
use crate::io::container::ContainerHandle;
use crate::io::ids::generate_run_id;
use crate::io::model::{
    CompletionRequest, ModelBackend, ModelRole, RetryPolicy, ToolChoice, complete_with_retry,
};
use crate::io::prompt::{
    SystemPromptInput, available_skills, render_failure_hint_prompt, render_system_prompt,
};
use crate::io::signals::{EventPayload, RunEvent, SignalSink};
use crate::io::state_store::StateStore;
use crate::io::tools::{self, Fetcher, ToolContext, ToolLimits, WebSearch};
use crate::run::{
    Attempt, Message, PendingApproval, RecoveryContext, Run, StepTrace, ToolCall, ToolInvocation,
};

/// Collaborators injected into the loop.
pub struct LoopDeps<'a> {
    pub model: &'a dyn ModelBackend,
    pub store: &'a dyn StateStore,
    pub sink: &'a dyn SignalSink,
    pub credentials: &'a CredentialStore,
    pub container: Option<Arc<dyn ContainerHandle>>,
    pub fetcher: Option<Arc<dyn Fetcher>>,
    pub searcher: Option<Arc<dyn WebSearch>>,
}

impl<'a> LoopDeps<'a> {
    pub fn new(
        model: &'a dyn ModelBackend,
        store: &'a dyn StateStore,
        sink: &'a dyn SignalSink,
        credentials: &'a CredentialStore,
    ) -> Self {
        Self {
            model,
            store,
            sink,
            credentials,
            container: None,
            fetcher: None,
            searcher: None,
        }
    }
}

/// Limits and locations for the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub max_attempts: u32,
    pub failure_threshold: u32,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
    pub limits: ToolLimits,
    pub redaction_min_len: usize,
    pub energy_per_model_call: f64,
    pub energy_per_tool_call: f64,
    pub workspaces_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub skills_dir: Option<PathBuf>,
    pub skills_output_dir: PathBuf,
}

impl LoopConfig {
    pub fn from_config(cfg: &CortexConfig) -> Self {
        Self {
            max_iterations: cfg.loop_.max_iterations,
            max_attempts: cfg.loop_.max_attempts,
            failure_threshold: cfg.loop_.failure_threshold,
            max_tokens: cfg.loop_.max_tokens,
            retry: cfg.model.retry_policy(),
            limits: cfg.tools.limits(),
            redaction_min_len: cfg.tools.redaction_min_len,
            energy_per_model_call: cfg.energy.per_model_call,
            energy_per_tool_call: cfg.energy.per_tool_call,
            workspaces_dir: cfg.workspaces_dir.clone(),
            artifacts_dir: cfg.artifacts_dir.clone(),
            skills_dir: cfg.skills_dir.clone(),
            skills_output_dir: cfg.skills_output_dir.clone(),
        }
    }

    /// Default limits with every directory placed under `base`.
    pub fn rooted_at(base: &Path) -> Self {
        let mut cfg = CortexConfig::default();
        cfg.workspaces_dir = base.join("workspaces");
        cfg.artifacts_dir = base.join("artifacts");
        cfg.skills_output_dir = base.join("skills_out");
        Self::from_config(&cfg)
    }
}

/// Cooperative cancellation, checked at iteration boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why an attempt stopped for a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    AwaitingInput { question: String },
    AwaitingApproval(PendingApproval),
}

/// How one loop invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed(TaskResult),
    Paused(PauseReason),
    Failed(FailureSummary),
}

/// A task handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub task: String,
    pub tools: Vec<String>,
    pub domains: Option<Vec<String>>,
}

/// Create a run for `request`, persist it and drive its first attempt.
#[instrument(skip_all)]
pub fn start_run(
    request: TaskRequest,
    deps: &LoopDeps<'_>,
    cfg: &LoopConfig,
    cancel: &CancelToken,
) -> Result<(Run, AttemptOutcome)> {
    if request.task.trim().is_empty() {
        bail!("task must not be empty");
    }
    if let Some(unknown) = request
        .tools
        .iter()
        .find(|name| ToolName::parse(name).is_none())
    {
        bail!("unknown tool '{unknown}'");
    }
    if let Some(synthetic) = request
        .tools
        .iter()
        .find(|name| ToolName::parse(name).is_some_and(ToolName::is_synthetic))
    {
        bail!("'{synthetic}' is always available and cannot be granted");
    }

    let unregistered: Vec<String> = placeholder_names(&Value::String(request.task.clone()))
        .into_iter()
        .filter(|name| deps.credentials.get(name).is_none())
        .collect();
    if !unregistered.is_empty() {
        warn!(credentials = ?unregistered, "task references unregistered credentials");
    }

    let mut run = Run::new(
        generate_run_id(),
        request.task,
        request.tools,
        request.domains,
        cfg.max_attempts,
    );
    begin_attempt(&mut run, deps, cfg, None)?;
    deps.store.create_run(&run)?;
    info!(run_id = %run.id, tools = ?run.tools, "run created");
    let outcome = run_attempt(&mut run, deps, cfg, cancel)?;
    Ok((run, outcome))
}

/// Append a new attempt, create its workspace and seed its transcript.
///
/// The caller persists the run.
pub fn begin_attempt(
    run: &mut Run,
    deps: &LoopDeps<'_>,
    cfg: &LoopConfig,
    recovery: Option<RecoveryContext>,
) -> Result<()> {
    let index = run.start_attempt(cfg.max_iterations, recovery)?.index;
    let workspace = cfg.workspaces_dir.join(&run.id).join(format!("a{index}"));
    fs::create_dir_all(&workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    let workspace = fs::canonicalize(&workspace)
        .with_context(|| format!("canonicalize workspace {}", workspace.display()))?;

    let tools: Vec<String> = schemas_for(run.tools.iter().map(String::as_str))
        .into_iter()
        .map(|schema| schema.name)
        .collect();
    let prompt = render_system_prompt(&SystemPromptInput {
        task: &run.task,
        tools,
        domains: run.domains.as_deref(),
        credentials: deps.credentials.names().map(str::to_string).collect(),
        skills: cfg
            .skills_dir
            .as_deref()
            .map(available_skills)
            .unwrap_or_default(),
        recovery: current_attempt(run)?.recovery_context.as_ref(),
    })?;
    let task = run.task.clone();

    let attempt = current_attempt_mut(run)?;
    attempt.workspace = Some(workspace);
    attempt.messages.push(Message::system(prompt));
    attempt.messages.push(Message::user(task));
    debug!(attempt = index, "attempt prepared");
    Ok(())
}

/// Drive the current (running) attempt until it completes, fails or pauses.
#[instrument(skip_all, fields(run_id = %run.id))]
pub fn run_attempt(
    run: &mut Run,
    deps: &LoopDeps<'_>,
    cfg: &LoopConfig,
    cancel: &CancelToken,
) -> Result<AttemptOutcome> {
    let attempt = current_attempt(run)?;
    if attempt.status != AttemptStatus::Running {
        bail!(
            "attempt {} is {}, not running",
            attempt.id,
            attempt.status.run_status()
        );
    }
    let workspace = attempt
        .workspace
        .clone()
        .with_context(|| format!("attempt {} has no workspace", attempt.id))?;
    let start = attempt.step_cursor;
    let max_iterations = attempt.max_iterations;
    info!(attempt = attempt.index, start, max_iterations, "attempt loop started");

    let redactor = deps.credentials.redactor(cfg.redaction_min_len);
    let mut driver = Driver {
        deps,
        cfg,
        tools: tool_context(run, deps, cfg, workspace, redactor.clone()),
        redactor,
        schemas: schemas_for(run.tools.iter().map(String::as_str)),
        delivered: BTreeSet::new(),
    };

    for iteration in start..max_iterations {
        let flow = if cancel.is_cancelled() {
            StepFlow::Fail(Failure::forced(FailureCategory::InfraFailure, "cancelled"))
        } else {
            driver.step(run, iteration)?
        };
        match flow {
            StepFlow::Continue => deps.store.update_run(run)?,
            StepFlow::Pause(reason) => return driver.pause(run, reason),
            StepFlow::Complete(summary) => return driver.complete(run, summary),
            StepFlow::Fail(failure) => return driver.fail(run, failure),
        }
    }

    driver.fail(
        run,
        Failure::forced(
            FailureCategory::BudgetExhausted,
            format!("reached the iteration limit of {max_iterations}"),
        ),
    )
}

/// Result of one loop iteration.
enum StepFlow {
    Continue,
    Pause(PauseReason),
    Complete(String),
    Fail(Failure),
}

enum CallFlow {
    Done(ToolResult),
    Pause(PauseReason),
}

struct Failure {
    category: Option<FailureCategory>,
    trigger: TriggerError,
    /// `None` takes the attempt's current streak length.
    consecutive: Option<u32>,
}

impl Failure {
    fn forced(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category: Some(category),
            trigger: TriggerError::other(message),
            consecutive: None,
        }
    }

    fn repeated_tool_error(code: ErrorCode, message: impl Into<String>, count: u32) -> Self {
        Self {
            category: None,
            trigger: TriggerError::tool(code, message),
            consecutive: Some(count),
        }
    }
}

struct Driver<'d, 'a> {
    deps: &'d LoopDeps<'a>,
    cfg: &'d LoopConfig,
    redactor: Redactor,
    tools: ToolContext,
    schemas: Vec<ToolSchema>,
    /// Credentials already handed to the container by this loop.
    delivered: BTreeSet<String>,
}

impl Driver<'_, '_> {
    fn step(&mut self, run: &mut Run, iteration: u32) -> Result<StepFlow> {
        let request = CompletionRequest {
            messages: current_attempt(run)?.messages.clone(),
            tools: self.schemas.clone(),
            tool_choice: ToolChoice::Auto,
            max_tokens: self.cfg.max_tokens,
            role: ModelRole::Motor,
        };
        run.energy_consumed += self.cfg.energy_per_model_call;
        let response = match complete_with_retry(self.deps.model, &request, self.cfg.retry) {
            Ok(response) => response,
            Err(err) => {
                let message = self.redactor.redact(&format!("model backend: {}", err.message()));
                warn!(iteration, err = %message, "model call failed");
                return Ok(StepFlow::Fail(Failure::forced(
                    FailureCategory::ModelFailure,
                    message,
                )));
            }
        };

        let content = self.redactor.redact(&response.content);
        let calls = response.normalized_tool_calls(iteration);
        let recorded: Vec<ToolCall> = calls
            .iter()
            .map(|call| ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: self.redactor.redact_value(&call.arguments),
            })
            .collect();
        let attempt = current_attempt_mut(run)?;
        attempt
            .messages
            .push(Message::assistant(content.clone(), recorded.clone()));
        debug!(iteration, calls = calls.len(), model = %response.model, "model turn");

        if calls.is_empty() {
            let had_tool_errors = attempt.trace.has_tool_errors();
            record_step(attempt, iteration, &response.model, Vec::new());
            return Ok(match classify_stop(&content, had_tool_errors) {
                StopKind::Completion => StepFlow::Complete(content),
                StopKind::Degenerate => StepFlow::Fail(Failure::forced(
                    FailureCategory::ModelFailure,
                    "the model stopped without a usable answer after tool errors",
                )),
            });
        }

        let mut invocations = Vec::with_capacity(calls.len());
        for (call, recorded) in calls.iter().zip(recorded) {
            match self.handle_call(run, call)? {
                CallFlow::Pause(reason) => {
                    let attempt = current_attempt_mut(run)?;
                    attempt.pending_tool_call_id = Some(call.id.clone());
                    match &reason {
                        PauseReason::AwaitingInput { question } => {
                            attempt.pending_question = Some(question.clone());
                            attempt.status = AttemptStatus::AwaitingInput;
                        }
                        PauseReason::AwaitingApproval(approval) => {
                            attempt.pending_approval = Some(approval.clone());
                            attempt.status = AttemptStatus::AwaitingApproval;
                        }
                    }
                    record_step(attempt, iteration, &response.model, invocations);
                    run.sync_status();
                    return Ok(StepFlow::Pause(reason));
                }
                CallFlow::Done(mut result) => {
                    result.output = self.redactor.redact(&result.output);
                    let attempt = current_attempt_mut(run)?;
                    attempt
                        .messages
                        .push(Message::tool(&call.id, result.output.clone()));
                    let streak = record_outcome(
                        &mut attempt.failure_streak,
                        &call.name,
                        &recorded.arguments,
                        &result,
                    );
                    let failed_code = result.error_code.filter(|_| !result.ok);
                    let output = result.output.clone();
                    invocations.push(ToolInvocation {
                        tool_call_id: recorded.id,
                        tool: recorded.name,
                        arguments: recorded.arguments,
                        result,
                    });
                    if let Some(code) = failed_code
                        && streak >= self.cfg.failure_threshold
                    {
                        warn!(
                            iteration,
                            tool = %call.name,
                            streak,
                            "repeated identical tool failure"
                        );
                        record_step(attempt, iteration, &response.model, invocations);
                        return Ok(StepFlow::Fail(Failure::repeated_tool_error(
                            code, output, streak,
                        )));
                    }
                }
            }
        }

        record_step(
            current_attempt_mut(run)?,
            iteration,
            &response.model,
            invocations,
        );
        Ok(StepFlow::Continue)
    }

    fn handle_call(&mut self, run: &mut Run, call: &ToolCall) -> Result<CallFlow> {
        let tool = ToolName::parse(&call.name);
        let synthetic = tool.filter(|tool| tool.is_synthetic());
        if synthetic.is_none() && !run.is_granted(&call.name) {
            debug!(tool = %call.name, "call to tool outside the grant");
            return Ok(CallFlow::Done(ToolResult::error(
                ErrorCode::ToolNotAvailable,
                format!("tool '{}' is not available in this run", call.name),
                false,
            )));
        }

        if let Some(tool) = synthetic {
            return Ok(match ToolArgs::parse_for(tool, &call.arguments) {
                Ok(ToolArgs::AskUser(args)) => CallFlow::Pause(PauseReason::AwaitingInput {
                    question: self.redactor.redact(&args.question),
                }),
                Ok(ToolArgs::RequestApproval(args)) => {
                    CallFlow::Pause(PauseReason::AwaitingApproval(PendingApproval {
                        action: self.redactor.redact(&args.action),
                        reason: args.reason.map(|r| self.redactor.redact(&r)),
                    }))
                }
                Ok(other) => CallFlow::Done(ToolResult::error(
                    ErrorCode::ExecutionError,
                    format!("{} cannot pause the run", other.tool()),
                    false,
                )),
                Err(err) => CallFlow::Done(ToolResult::error(
                    ErrorCode::InvalidArgs,
                    err.to_string(),
                    false,
                )),
            });
        }

        let resolution = resolve_placeholders(&call.arguments, self.deps.credentials);
        if !resolution.is_complete() {
            info!(
                tool = %call.name,
                missing = ?resolution.missing,
                "call references unregistered credentials"
            );
            return Ok(CallFlow::Done(ToolResult::error(
                ErrorCode::AuthFailed,
                missing_credentials_message(&resolution.missing),
                false,
            )));
        }
        if let Some(failed) = self.deliver_credentials(&resolution.used) {
            return Ok(CallFlow::Done(failed));
        }

        run.energy_consumed += self.cfg.energy_per_tool_call;
        Ok(CallFlow::Done(tools::execute(
            &call.name,
            &resolution.value,
            &self.tools,
        )))
    }

    fn deliver_credentials(&mut self, names: &[String]) -> Option<ToolResult> {
        let container = self.tools.container.clone()?;
        for name in names {
            if self.delivered.contains(name) {
                continue;
            }
            let Some(value) = self.deps.credentials.get(name) else {
                continue;
            };
            if let Err(err) = container.deliver_credential(name, value) {
                let err = self.redactor.redact(&format!("{err:#}"));
                warn!(credential = %name, err = %err, "credential delivery failed");
                return Some(ToolResult::error(
                    ErrorCode::ExecutionError,
                    format!("could not deliver credential {name} to the container"),
                    true,
                ));
            }
            debug!(credential = %name, "credential delivered to container");
            self.delivered.insert(name.clone());
        }
        None
    }

    fn pause(&self, run: &mut Run, reason: PauseReason) -> Result<AttemptOutcome> {
        self.deps.store.update_run(run)?;
        let tool_call_id = current_attempt(run)?
            .pending_tool_call_id
            .clone()
            .unwrap_or_default();
        let payload = match &reason {
            PauseReason::AwaitingInput { question } => EventPayload::AwaitingInput {
                question: question.clone(),
                tool_call_id,
            },
            PauseReason::AwaitingApproval(approval) => EventPayload::AwaitingApproval {
                approval: approval.clone(),
                tool_call_id,
            },
        };
        info!(status = %run.status, "attempt paused");
        self.emit(run, payload);
        Ok(AttemptOutcome::Paused(reason))
    }

    fn complete(&self, run: &mut Run, summary: String) -> Result<AttemptOutcome> {
        let workspace = self.tools.workspace.as_path();
        let artifacts = persist_artifacts(workspace, &self.cfg.artifacts_dir, &run.id)
            .unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "artifact persistence failed");
                Vec::new()
            });
        let skills = extract_skills(workspace, &self.cfg.skills_output_dir).unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "skill extraction failed");
            Vec::new()
        });
        let result = TaskResult {
            summary,
            artifacts,
            skills,
        };

        let now = Utc::now();
        let attempt = current_attempt_mut(run)?;
        attempt.status = AttemptStatus::Completed;
        attempt.ended_at = Some(now);
        run.result = Some(result.clone());
        run.completed_at = Some(now);
        run.sync_status();
        self.deps.store.update_run(run)?;
        info!(
            artifacts = result.artifacts.len(),
            skills = result.skills.len(),
            energy = run.energy_consumed,
            "attempt completed"
        );
        self.emit(
            run,
            EventPayload::Completed {
                result: result.clone(),
            },
        );
        Ok(AttemptOutcome::Completed(result))
    }

    fn fail(&self, run: &mut Run, failure: Failure) -> Result<AttemptOutcome> {
        let attempt = current_attempt(run)?;
        let consecutive = failure.consecutive.unwrap_or_else(|| {
            attempt
                .failure_streak
                .as_ref()
                .map_or(0, |streak| streak.count)
        });
        let trigger = TriggerError {
            message: self.redactor.redact(&failure.trigger.message),
            ..failure.trigger
        };
        let mut summary = classify(&attempt.trace, consecutive, Some(&trigger), failure.category);
        if summary.retryable {
            summary.hint = self.failure_hint(run, &summary);
        }

        let now = Utc::now();
        let attempt = current_attempt_mut(run)?;
        attempt.failure = Some(summary.clone());
        attempt.status = AttemptStatus::Failed;
        attempt.ended_at = Some(now);
        attempt.clear_pending();
        run.sync_status();
        if run.is_terminal() {
            run.completed_at = Some(now);
        }
        self.deps.store.update_run(run)?;
        warn!(
            category = summary.category.as_str(),
            retryable = summary.retryable,
            consecutive,
            "attempt failed"
        );
        self.emit(
            run,
            EventPayload::Failed {
                failure: summary.clone(),
            },
        );
        Ok(AttemptOutcome::Failed(summary))
    }

    /// One side request outside the transcript; any failure yields no hint.
    fn failure_hint(&self, run: &mut Run, summary: &FailureSummary) -> Option<String> {
        let prompt = match render_failure_hint_prompt(&run.task, summary) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "render failure hint prompt");
                return None;
            }
        };
        let request = CompletionRequest {
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            max_tokens: self.cfg.max_tokens,
            role: ModelRole::FailureHint,
        };
        run.energy_consumed += self.cfg.energy_per_model_call;
        match self.deps.model.complete(&request) {
            Ok(response) => {
                let hint = response.content.trim();
                (!hint.is_empty()).then(|| self.redactor.redact(hint))
            }
            Err(err) => {
                debug!(err = %err, "failure hint unavailable");
                None
            }
        }
    }

    fn emit(&self, run: &Run, payload: EventPayload) {
        let event = RunEvent::new(&run.id, run.current_attempt_index, payload);
        if let Err(err) = self.deps.sink.emit(&event) {
            warn!(kind = event.payload.kind(), err = %format!("{err:#}"), "event emission failed");
        }
    }
}

fn tool_context(
    run: &Run,
    deps: &LoopDeps<'_>,
    cfg: &LoopConfig,
    workspace: PathBuf,
    redactor: Redactor,
) -> ToolContext {
    let mut ctx = ToolContext::new(workspace)
        .with_limits(cfg.limits)
        .with_redactor(redactor);
    if let Some(skills) = cfg.skills_dir.as_ref().filter(|dir| dir.is_dir()) {
        ctx = ctx.with_read_root(skills.clone());
    }
    ctx.container = deps.container.clone();
    ctx.allowed_domains = run.domains.clone();
    ctx.fetcher = deps.fetcher.clone();
    ctx.searcher = deps.searcher.clone();
    ctx
}

fn record_step(
    attempt: &mut Attempt,
    iteration: u32,
    model: &str,
    tool_calls: Vec<ToolInvocation>,
) {
    attempt.trace.push(StepTrace {
        iteration,
        timestamp: Utc::now(),
        model: model.to_string(),
        tool_calls,
    });
    attempt.step_cursor = attempt.step_cursor.max(iteration + 1);
}

fn current_attempt(run: &Run) -> Result<&Attempt> {
    run.current_attempt().context("run has no current attempt")
}

fn current_attempt_mut(run: &mut Run) -> Result<&mut Attempt> {
    run.current_attempt_mut()
        .context("run has no current attempt")
}
