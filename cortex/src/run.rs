//! Run and attempt records: the persisted shape of a delegated task.
//!
//! A [`Run`] is one externally requested task with a fixed capability grant.
//! Each [`Attempt`] is one pass over the task with its own transcript, trace
//! and resumability cursor. Runs are serialized whole by the state store.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::failure_tracker::FailureStreak;
use crate::core::types::{
    AttemptStatus, FailureCategory, FailureSummary, RunStatus, TaskResult, ToolResult,
};

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// One tool invocation recorded in a step trace.
///
/// `arguments` are the arguments as requested by the model, with credential
/// placeholders left unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub result: ToolResult,
}

/// Audit record of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTrace {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub tool_calls: Vec<ToolInvocation>,
}

/// Append-only audit log of an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTrace {
    pub steps: Vec<StepTrace>,
}

impl RunTrace {
    pub fn push(&mut self, step: StepTrace) {
        self.steps.push(step);
    }

    pub fn has_tool_errors(&self) -> bool {
        self.steps
            .iter()
            .flat_map(|step| &step.tool_calls)
            .any(|call| !call.result.ok)
    }
}

/// Sign-off requested through `request_approval`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Guidance carried from a failed attempt into the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub previous_attempt_index: u32,
    pub failure: FailureSummary,
    pub guidance: String,
}

impl RecoveryContext {
    /// Build recovery guidance from a previous failure, preferring explicit guidance,
    /// then the classifier hint, then a category default.
    pub fn from_failure(
        previous_attempt_index: u32,
        failure: &FailureSummary,
        guidance: Option<String>,
    ) -> Self {
        let guidance = guidance
            .filter(|g| !g.trim().is_empty())
            .or_else(|| failure.hint.clone())
            .unwrap_or_else(|| default_guidance(failure.category).to_string());
        Self {
            previous_attempt_index,
            failure: failure.clone(),
            guidance,
        }
    }
}

fn default_guidance(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::ToolFailure => {
            "The previous attempt kept hitting the same tool error. Try a different approach instead of repeating the failing call."
        }
        FailureCategory::ModelFailure => {
            "The previous attempt stopped without finishing. Use real tool calls and finish with a plain summary."
        }
        _ => "The previous attempt failed. Re-check the task and proceed carefully.",
    }
}

/// One execution pass over a run's task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub index: u32,
    pub status: AttemptStatus,
    pub messages: Vec<Message>,
    /// Next iteration to execute. Never decreases.
    pub step_cursor: u32,
    pub max_iterations: u32,
    pub trace: RunTrace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_context: Option<RecoveryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_streak: Option<FailureStreak>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn is_paused(&self) -> bool {
        matches!(
            self.status,
            AttemptStatus::AwaitingInput | AttemptStatus::AwaitingApproval
        )
    }

    pub fn clear_pending(&mut self) {
        self.pending_question = None;
        self.pending_approval = None;
        self.pending_tool_call_id = None;
    }
}

/// One externally requested task with a fixed tool/domain capability grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task: String,
    /// Granted tool names. Fixed at creation.
    pub tools: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    pub status: RunStatus,
    pub attempts: Vec<Attempt>,
    pub current_attempt_index: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub energy_consumed: f64,
}

impl Run {
    pub fn new(
        id: impl Into<String>,
        task: impl Into<String>,
        tools: impl IntoIterator<Item = String>,
        domains: Option<Vec<String>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            tools: tools.into_iter().collect(),
            domains,
            status: RunStatus::Created,
            attempts: Vec::new(),
            current_attempt_index: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            energy_consumed: 0.0,
        }
    }

    pub fn is_granted(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }

    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.get(self.current_attempt_index as usize)
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.get_mut(self.current_attempt_index as usize)
    }

    /// True once the run completed or no further attempt may be started.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            RunStatus::Completed => true,
            RunStatus::Failed => self.attempts.len() as u32 >= self.max_attempts,
            _ => false,
        }
    }

    /// Append a fresh attempt and make it current.
    pub fn start_attempt(
        &mut self,
        max_iterations: u32,
        recovery_context: Option<RecoveryContext>,
    ) -> Result<&mut Attempt> {
        if self.status == RunStatus::Completed {
            bail!("run {} already completed", self.id);
        }
        if self.status.is_active() {
            bail!(
                "run {} already has an attempt in progress ({})",
                self.id,
                self.status
            );
        }
        let index = self.attempts.len() as u32;
        if index >= self.max_attempts {
            bail!(
                "run {} exhausted its {} attempts",
                self.id,
                self.max_attempts
            );
        }
        if max_iterations == 0 {
            bail!("max_iterations must be > 0");
        }

        let now = Utc::now();
        self.attempts.push(Attempt {
            id: format!("{}-a{index}", self.id),
            index,
            status: AttemptStatus::Running,
            messages: Vec::new(),
            step_cursor: 0,
            max_iterations,
            trace: RunTrace::default(),
            pending_question: None,
            pending_approval: None,
            pending_tool_call_id: None,
            recovery_context,
            failure: None,
            failure_streak: None,
            workspace: None,
            started_at: now,
            ended_at: None,
        });
        self.current_attempt_index = index;
        self.status = RunStatus::Running;
        self.started_at.get_or_insert(now);
        let attempt = &mut self.attempts[index as usize];
        Ok(attempt)
    }

    /// Copy the current attempt's status onto the run.
    pub fn sync_status(&mut self) {
        if let Some(status) = self.current_attempt().map(|attempt| attempt.status) {
            self.status = status.run_status();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SuggestedAction;

    fn run(max_attempts: u32) -> Run {
        Run::new(
            "run-1",
            "do it",
            ["read_file".to_string()],
            None,
            max_attempts,
        )
    }

    #[test]
    fn start_attempt_appends_and_marks_running() {
        let mut run = run(2);
        let attempt = run.start_attempt(5, None).expect("start");
        assert_eq!(attempt.index, 0);
        assert_eq!(attempt.id, "run-1-a0");
        assert_eq!(attempt.step_cursor, 0);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
    }

    #[test]
    fn start_attempt_refuses_while_one_is_active() {
        let mut run = run(2);
        run.start_attempt(5, None).expect("start");
        let err = run.start_attempt(5, None).unwrap_err();
        assert!(err.to_string().contains("in progress"));
    }

    #[test]
    fn start_attempt_respects_max_attempts() {
        let mut run = run(1);
        run.start_attempt(5, None).expect("start");
        run.attempts[0].status = AttemptStatus::Failed;
        run.sync_status();
        assert!(run.is_terminal());
        let err = run.start_attempt(5, None).unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn recovery_prefers_explicit_guidance_then_hint() {
        let failure = FailureSummary {
            category: FailureCategory::ToolFailure,
            retryable: true,
            suggested_action: SuggestedAction::RetryWithGuidance,
            last_error_code: None,
            last_error: None,
            last_tool_results: Vec::new(),
            consecutive_failures: 3,
            hint: Some("use a smaller file".to_string()),
        };
        let from_hint = RecoveryContext::from_failure(0, &failure, None);
        assert_eq!(from_hint.guidance, "use a smaller file");

        let explicit = RecoveryContext::from_failure(0, &failure, Some("try grep".to_string()));
        assert_eq!(explicit.guidance, "try grep");

        let no_hint = FailureSummary {
            hint: None,
            ..failure
        };
        let fallback = RecoveryContext::from_failure(0, &no_hint, Some("  ".to_string()));
        assert!(fallback.guidance.contains("different approach"));
    }
}
