//! Model backend abstraction.
//!
//! The [`ModelBackend`] trait decouples the attempt loop from the actual
//! language-model provider. [`CommandBackend`] drives any provider through a
//! helper program; tests use scripted backends that return predetermined
//! replies without spawning processes.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::budget::{backoff_delay, should_retry};
use crate::core::tool_args::ToolSchema;
use crate::io::process::run_command_with_timeout;
use crate::run::{Message, ToolCall};

/// Exit code a helper uses to report a transient failure (`EX_TEMPFAIL`).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Which caller a request serves; backends may route on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// The attempt loop's main turn.
    Motor,
    /// Best-effort failure hint side request.
    FailureHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub role: ModelRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub model: String,
}

/// A tool call as the backend reported it: the id may be missing and the
/// arguments may arrive as a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl CompletionResponse {
    /// Tool calls with ids filled in and string-encoded arguments decoded.
    pub fn normalized_tool_calls(&self, iteration: u32) -> Vec<ToolCall> {
        self.tool_calls
            .iter()
            .enumerate()
            .map(|(idx, raw)| ToolCall {
                id: if raw.id.trim().is_empty() {
                    format!("call_{iteration}_{idx}")
                } else {
                    raw.id.clone()
                },
                name: raw.name.clone(),
                arguments: decode_arguments(&raw.arguments),
            })
            .collect()
    }
}

fn decode_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::String(encoded) => {
            serde_json::from_str(encoded).unwrap_or_else(|_| arguments.clone())
        }
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    }
}

/// Backend failure, split by whether retrying may help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    Transient(String),
    Fatal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ModelError::Transient(msg) | ModelError::Fatal(msg) => msg,
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Transient(msg) => write!(f, "transient model error: {msg}"),
            ModelError::Fatal(msg) => write!(f, "model error: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Abstraction over language-model backends.
pub trait ModelBackend: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ModelError>;
}

/// Retry settings for transient backend errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, first included.
    pub max_tries: u32,
    /// Base delay; the wait before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: crate::core::budget::DEFAULT_MAX_TRIES,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Call the backend, retrying transient errors with linear backoff.
///
/// Fatal errors return immediately; the last transient error is returned once
/// tries are exhausted.
#[instrument(skip_all, fields(role = ?request.role, max_tries = policy.max_tries))]
pub fn complete_with_retry(
    backend: &dyn ModelBackend,
    request: &CompletionRequest,
    policy: RetryPolicy,
) -> Result<CompletionResponse, ModelError> {
    let mut tries = 0;
    loop {
        tries += 1;
        match backend.complete(request) {
            Ok(response) => {
                debug!(tries, model = %response.model, "model call succeeded");
                return Ok(response);
            }
            Err(err @ ModelError::Fatal(_)) => return Err(err),
            Err(err) => {
                if !should_retry(tries, policy.max_tries) {
                    warn!(tries, err = %err, "model retries exhausted");
                    return Err(err);
                }
                let delay = backoff_delay(policy.backoff, tries);
                warn!(
                    tries,
                    delay_ms = delay.as_millis() as u64,
                    err = %err,
                    "transient model error, retrying"
                );
                thread::sleep(delay);
            }
        }
    }
}

/// Backend that spawns a helper program per request.
///
/// The request JSON is written to stdin; the response JSON is read from
/// stdout. A timeout or exit code [`EXIT_TEMPFAIL`] is transient; any other
/// failure, including unparseable output, is fatal.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            timeout,
            output_limit_bytes,
        }
    }
}

impl ModelBackend for CommandBackend {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ModelError> {
        let (program, rest) = self
            .argv
            .split_first()
            .ok_or_else(|| ModelError::Fatal("model command is empty".to_string()))?;
        let payload = serde_json::to_vec(request)
            .map_err(|e| ModelError::Fatal(format!("serialize request: {e}")))?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(rest);
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| ModelError::Fatal(format!("run {program}: {e:#}")))?;

        if output.timed_out {
            return Err(ModelError::Transient(format!(
                "{program} timed out after {}s",
                self.timeout.as_secs()
            )));
        }
        match output.status.code() {
            Some(0) => {}
            Some(EXIT_TEMPFAIL) => {
                return Err(ModelError::Transient(format!(
                    "{program} reported a temporary failure: {}",
                    output.stderr_text().trim()
                )));
            }
            code => {
                return Err(ModelError::Fatal(format!(
                    "{program} exited with {code:?}: {}",
                    output.stderr_text().trim()
                )));
            }
        }
        if output.stdout_truncated > 0 {
            return Err(ModelError::Fatal(format!(
                "{program} response exceeded {} bytes",
                self.output_limit_bytes
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ModelError::Fatal(format!("parse {program} response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Flaky {
        failures: Mutex<Vec<ModelError>>,
    }

    impl ModelBackend for Flaky {
        fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, ModelError> {
            let mut failures = self.failures.lock().expect("lock");
            if failures.is_empty() {
                Ok(CompletionResponse {
                    content: "done".to_string(),
                    tool_calls: Vec::new(),
                    finish_reason: Some("stop".to_string()),
                    model: "flaky".to_string(),
                })
            } else {
                Err(failures.remove(0))
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            max_tokens: 100,
            role: ModelRole::Motor,
        }
    }

    fn no_wait(max_tries: u32) -> RetryPolicy {
        RetryPolicy {
            max_tries,
            backoff: Duration::ZERO,
        }
    }

    fn transient() -> ModelError {
        ModelError::Transient("overloaded".to_string())
    }

    #[test]
    fn two_transient_errors_then_success() {
        let backend = Flaky {
            failures: Mutex::new(vec![transient(), transient()]),
        };
        let response = complete_with_retry(&backend, &request(), no_wait(3)).expect("complete");
        assert_eq!(response.content, "done");
    }

    #[test]
    fn exhausted_retries_return_last_error() {
        let backend = Flaky {
            failures: Mutex::new(vec![transient(), transient(), transient()]),
        };
        let err = complete_with_retry(&backend, &request(), no_wait(3)).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let backend = Flaky {
            failures: Mutex::new(vec![ModelError::Fatal("bad key".to_string())]),
        };
        let err = complete_with_retry(&backend, &request(), no_wait(3)).unwrap_err();
        assert_eq!(err, ModelError::Fatal("bad key".to_string()));
    }

    #[test]
    fn normalizes_ids_and_string_arguments() {
        let response = CompletionResponse {
            content: String::new(),
            tool_calls: vec![
                RawToolCall {
                    id: String::new(),
                    name: "read_file".to_string(),
                    arguments: json!("{\"path\": \"a.txt\"}"),
                },
                RawToolCall {
                    id: "abc".to_string(),
                    name: "list_dir".to_string(),
                    arguments: Value::Null,
                },
            ],
            finish_reason: None,
            model: "m".to_string(),
        };
        let calls = response.normalized_tool_calls(4);
        assert_eq!(calls[0].id, "call_4_0");
        assert_eq!(calls[0].arguments, json!({"path": "a.txt"}));
        assert_eq!(calls[1].id, "abc");
        assert_eq!(calls[1].arguments, json!({}));
    }

    fn sh_backend(script: &str) -> CommandBackend {
        CommandBackend::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(10),
            64 * 1024,
        )
    }

    #[test]
    fn command_backend_parses_stdout() {
        let backend = sh_backend(
            r#"cat >/dev/null; echo '{"content":"ok","tool_calls":[{"id":"1","name":"shell","arguments":{"command":"ls"}}],"model":"cmd"}'"#,
        );
        let response = backend.complete(&request()).expect("complete");
        assert_eq!(response.content, "ok");
        assert_eq!(response.model, "cmd");
        assert_eq!(response.tool_calls[0].name, "shell");
    }

    #[test]
    fn command_backend_classifies_exit_codes() {
        let transient = sh_backend("cat >/dev/null; exit 75").complete(&request()).unwrap_err();
        assert!(transient.is_transient());
        let fatal = sh_backend("cat >/dev/null; exit 2").complete(&request()).unwrap_err();
        assert!(!fatal.is_transient());
        let garbage = sh_backend("cat >/dev/null; echo not-json").complete(&request()).unwrap_err();
        assert!(!garbage.is_transient());
    }
}
