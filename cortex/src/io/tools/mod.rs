//! Tool executor: typed dispatch of model tool calls inside the sandbox.
//!
//! Every tool produces a [`ToolResult`]; failures are values the model can
//! react to, never Rust errors. Filesystem tools resolve paths through
//! [`crate::io::sandbox`] before any read or write.

mod exec;
mod fs;
mod grep;
pub mod network;
mod patch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::credentials::Redactor;
use crate::core::tool_args::{ArgsError, ToolArgs};
use crate::core::types::{ErrorCode, Provenance, ToolResult};
use crate::io::container::ContainerHandle;
use crate::io::process::{STDERR_CUT_NOTICE, STDOUT_CUT_NOTICE};

pub use network::{
    CommandFetcher, CommandSearch, FetchRequest, Fetcher, SearchRequest, WebSearch,
    domain_allowed,
};

/// Per-call resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            output_limit_bytes: 50_000,
        }
    }
}

/// Everything a tool may touch.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    /// Readable roots: the workspace, then the read-only skills directory.
    pub allowed_roots: Vec<PathBuf>,
    /// Writable roots: the workspace only.
    pub write_roots: Vec<PathBuf>,
    pub container: Option<Arc<dyn ContainerHandle>>,
    /// `None` leaves network tools unrestricted.
    pub allowed_domains: Option<Vec<String>>,
    pub fetcher: Option<Arc<dyn Fetcher>>,
    pub searcher: Option<Arc<dyn WebSearch>>,
    pub limits: ToolLimits,
    /// Applied to raw output before any byte cap.
    pub redactor: Redactor,
}

impl ToolContext {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            allowed_roots: vec![workspace.clone()],
            write_roots: vec![workspace.clone()],
            workspace,
            container: None,
            allowed_domains: None,
            fetcher: None,
            searcher: None,
            limits: ToolLimits::default(),
            redactor: Redactor::default(),
        }
    }

    /// Add a read-only root after the workspace.
    pub fn with_read_root(mut self, root: PathBuf) -> Self {
        self.allowed_roots.push(root);
        self
    }

    pub fn with_limits(mut self, limits: ToolLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("workspace", &self.workspace)
            .field("allowed_roots", &self.allowed_roots)
            .field("write_roots", &self.write_roots)
            .field("container", &self.container.is_some())
            .field("allowed_domains", &self.allowed_domains)
            .field("fetcher", &self.fetcher.is_some())
            .field("searcher", &self.searcher.is_some())
            .field("limits", &self.limits)
            .field("redactor", &self.redactor)
            .finish()
    }
}

/// Failed tool outcome, converted into a [`ToolResult`] at the dispatch boundary.
type ToolOutcome = Result<String, ToolResult>;

/// Execute tool `name` with already-resolved `args`.
///
/// Grant checks belong to the caller; this only knows whether a tool exists.
#[instrument(skip_all, fields(tool = name))]
pub fn execute(name: &str, args: &Value, ctx: &ToolContext) -> ToolResult {
    let started = Instant::now();
    let result = match ToolArgs::parse(name, args) {
        Ok(args) => dispatch(args, ctx),
        Err(ArgsError::UnknownTool(unknown)) => ToolResult::error(
            ErrorCode::ToolNotAvailable,
            format!("tool '{unknown}' does not exist"),
            false,
        ),
        Err(err) => ToolResult::error(ErrorCode::InvalidArgs, err.to_string(), false),
    };
    let mut result = result.with_duration_ms(elapsed_ms(started));
    let redacted = redact_output(&result.output, &ctx.redactor);
    result.output = truncate_output(&redacted, ctx.limits.output_limit_bytes);
    debug!(
        ok = result.ok,
        error_code = ?result.error_code,
        duration_ms = result.duration_ms,
        "tool finished"
    );
    result
}

/// Redact secrets, including fragments left where a process stream was cut.
fn redact_output(output: &str, redactor: &Redactor) -> String {
    if redactor.is_noop() {
        return output.to_string();
    }
    [STDOUT_CUT_NOTICE, STDERR_CUT_NOTICE]
        .into_iter()
        .fold(redactor.redact(output), |text, notice| {
            mask_before(&text, notice, redactor)
        })
}

fn mask_before(text: &str, notice: &str, redactor: &Redactor) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(notice) {
        out.push_str(&redactor.mask_cut_tail(&rest[..pos]));
        out.push_str(notice);
        rest = &rest[pos + notice.len()..];
    }
    out.push_str(rest);
    out
}

fn dispatch(args: ToolArgs, ctx: &ToolContext) -> ToolResult {
    let tool = args.tool();
    let outcome = match args {
        ToolArgs::Code(a) => exec::run_code(&a, ctx),
        ToolArgs::Shell(a) => exec::run_shell(&a, ctx),
        ToolArgs::ReadFile(a) => fs::read_file(&a, ctx),
        ToolArgs::WriteFile(a) => fs::write_file(&a, ctx),
        ToolArgs::ListDir(a) => fs::list_dir(&a, ctx),
        ToolArgs::Grep(a) => grep::grep(&a, ctx),
        ToolArgs::Patch(a) => patch::patch(&a, ctx),
        ToolArgs::Fetch(a) => network::fetch(&a, ctx),
        ToolArgs::Search(a) => network::search(&a, ctx),
        ToolArgs::AskUser(_) | ToolArgs::RequestApproval(_) => Err(ToolResult::error(
            ErrorCode::ExecutionError,
            format!("{tool} is handled by the runtime loop, not the tool executor"),
            false,
        )),
    };
    let provenance = if tool.uses_network() {
        Provenance::External
    } else {
        Provenance::Internal
    };
    match outcome {
        Ok(output) => ToolResult::success(output),
        Err(failure) => failure,
    }
    .with_provenance(provenance)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Cap `text` at `limit` bytes on a char boundary, appending a notice.
pub fn truncate_output(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[output truncated: {} of {} bytes omitted]",
        &text[..cut],
        text.len() - cut,
        text.len()
    )
}

fn invalid(message: impl Into<String>) -> ToolResult {
    ToolResult::error(ErrorCode::InvalidArgs, message, false)
}

fn not_found(message: impl Into<String>) -> ToolResult {
    ToolResult::error(ErrorCode::NotFound, message, false)
}

fn execution_error(message: impl Into<String>, retryable: bool) -> ToolResult {
    ToolResult::error(ErrorCode::ExecutionError, message, retryable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = ToolContext::new(temp.path().to_path_buf());
        (temp, ctx)
    }

    #[test]
    fn unknown_tool_is_not_available() {
        let (_temp, ctx) = ctx();
        let result = execute("teleport", &json!({}), &ctx);
        assert_eq!(result.error_code, Some(ErrorCode::ToolNotAvailable));
        assert!(!result.retryable);
    }

    #[test]
    fn schema_violations_are_invalid_args() {
        let (_temp, ctx) = ctx();
        let result = execute("write_file", &json!({"path": "a.txt"}), &ctx);
        assert!(!result.ok);
        assert_eq!(result.error_code, Some(ErrorCode::InvalidArgs));
        assert!(!result.retryable);
    }

    #[test]
    fn synthetic_tools_are_rejected_by_the_executor() {
        let (_temp, ctx) = ctx();
        let result = execute("ask_user", &json!({"question": "why?"}), &ctx);
        assert_eq!(result.error_code, Some(ErrorCode::ExecutionError));
    }

    #[test]
    fn output_is_capped() {
        let (temp, mut ctx) = ctx();
        std::fs::write(temp.path().join("big.txt"), "x".repeat(100)).expect("write");
        ctx.limits.output_limit_bytes = 10;
        let result = execute("read_file", &json!({"path": "big.txt"}), &ctx);
        assert!(result.ok);
        assert!(
            result
                .output
                .starts_with("xxxxxxxxxx\n[output truncated: 90 of 100 bytes omitted]")
        );
    }

    #[test]
    fn secrets_are_redacted_before_the_cap() {
        let (temp, ctx) = ctx();
        let ctx = ctx
            .with_limits(ToolLimits {
                timeout: Duration::from_secs(10),
                output_limit_bytes: 20,
            })
            .with_redactor(Redactor::new(["ABCDEFGHIJKLMNOPQRSTUV".to_string()], 6));
        std::fs::write(temp.path().join("env.txt"), "token=ABCDEFGHIJKLMNOPQRSTUV")
            .expect("write");
        let result = execute("read_file", &json!({"path": "env.txt"}), &ctx);
        assert!(result.ok);
        assert_eq!(result.output, "token=[REDACTED]");
    }

    #[test]
    fn secret_cut_by_the_process_cap_is_masked() {
        let redactor = Redactor::new(["ABCDEFGHIJKLMNOPQRSTUV".to_string()], 6);
        let output =
            "token=ABCDEFGHIJKLMN\n[stdout truncated 8 bytes]\n[stderr]\nABCDEFGHIJKLMNOPQRSTUV";
        assert_eq!(
            redact_output(output, &redactor),
            "token=[REDACTED]\n[stdout truncated 8 bytes]\n[stderr]\n[REDACTED]"
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ééé";
        let out = truncate_output(text, 3);
        assert!(out.starts_with("é\n"));
    }
}
