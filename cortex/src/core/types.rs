//! Shared deterministic types for the motor cortex runtime.
//!
//! These types define stable contracts between the loop, the tool executor and
//! the failure classifier. They carry no I/O and serialize to stable JSON so
//! persisted run records remain readable across versions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    AwaitingInput,
    AwaitingApproval,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::AwaitingInput => "awaiting_input",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// A run that is running or waiting on a human counts as active.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Running | RunStatus::AwaitingInput | RunStatus::AwaitingApproval
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(RunStatus::Created),
            "running" => Ok(RunStatus::Running),
            "awaiting_input" => Ok(RunStatus::AwaitingInput),
            "awaiting_approval" => Ok(RunStatus::AwaitingApproval),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Lifecycle status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    AwaitingInput,
    AwaitingApproval,
    Completed,
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptStatus::Completed | AttemptStatus::Failed)
    }

    /// Run status mirrored from this attempt status.
    pub fn run_status(self) -> RunStatus {
        match self {
            AttemptStatus::Running => RunStatus::Running,
            AttemptStatus::AwaitingInput => RunStatus::AwaitingInput,
            AttemptStatus::AwaitingApproval => RunStatus::AwaitingApproval,
            AttemptStatus::Completed => RunStatus::Completed,
            AttemptStatus::Failed => RunStatus::Failed,
        }
    }
}

/// Tool-level error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgs,
    NotFound,
    /// Sandbox violation.
    PermissionDenied,
    /// Missing credential.
    AuthFailed,
    /// Capability not granted to the run.
    ToolNotAvailable,
    ExecutionError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "invalid_args",
            ErrorCode::NotFound => "not_found",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::ToolNotAvailable => "tool_not_available",
            ErrorCode::ExecutionError => "execution_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a tool's output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Internal,
    External,
}

/// Uniform output of any tool invocation.
///
/// `error_code` is present iff `ok` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub retryable: bool,
    #[serde(default)]
    pub provenance: Provenance,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            error_code: None,
            retryable: false,
            provenance: Provenance::Internal,
            duration_ms: 0,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            ok: false,
            output: message.into(),
            error_code: Some(code),
            retryable,
            provenance: Provenance::Internal,
            duration_ms: 0,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Coarse category of an attempt-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    ToolFailure,
    ModelFailure,
    BudgetExhausted,
    InvalidTask,
    InfraFailure,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::ToolFailure => "tool_failure",
            FailureCategory::ModelFailure => "model_failure",
            FailureCategory::BudgetExhausted => "budget_exhausted",
            FailureCategory::InvalidTask => "invalid_task",
            FailureCategory::InfraFailure => "infra_failure",
            FailureCategory::Unknown => "unknown",
        }
    }

    /// Budget, task and infrastructure failures are never worth retrying as-is.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            FailureCategory::BudgetExhausted
                | FailureCategory::InvalidTask
                | FailureCategory::InfraFailure
        )
    }
}

/// Next step recommended to whoever owns the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    RetryWithGuidance,
    AskUser,
    Stop,
}

/// Compact view of one tool outcome kept inside a failure summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcomeSummary {
    pub tool: String,
    pub ok: bool,
    pub output: String,
}

/// Structured, categorized explanation of why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub category: FailureCategory,
    pub retryable: bool,
    pub suggested_action: SuggestedAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_tool_results: Vec<ToolOutcomeSummary>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Result of a successfully completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}
