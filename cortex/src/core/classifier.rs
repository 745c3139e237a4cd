//! Deterministic classification of attempt failures.
//!
//! Turns the trace and the triggering error into a [`FailureSummary`] that an
//! external retry policy can act on. The optional model-written hint is added
//! separately by the attempt loop.

use serde::{Deserialize, Serialize};

use crate::core::types::{
    ErrorCode, FailureCategory, FailureSummary, SuggestedAction, ToolOutcomeSummary,
};
use crate::run::RunTrace;

/// Number of trailing steps whose tool outcomes are kept in a summary.
const RECENT_STEPS: usize = 2;
/// Character cap for each kept tool output.
const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Error that triggered the failure, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerError {
    /// Tool error code; `None` for non-tool errors (model backend, cancellation).
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl TriggerError {
    pub fn tool(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

/// Classify a failure.
///
/// - A forced category wins.
/// - Otherwise a triggering tool error yields `tool_failure`, anything else `unknown`.
/// - `auth_failed` suggests asking the user; non-retryable categories suggest stopping.
pub fn classify(
    trace: &RunTrace,
    consecutive_failures: u32,
    last_error: Option<&TriggerError>,
    category_override: Option<FailureCategory>,
) -> FailureSummary {
    let last_error_code = last_error.and_then(|err| err.code);
    let category = category_override.unwrap_or(match last_error_code {
        Some(_) => FailureCategory::ToolFailure,
        None => FailureCategory::Unknown,
    });
    let retryable = category.is_retryable();
    let suggested_action = if !retryable {
        SuggestedAction::Stop
    } else if last_error_code == Some(ErrorCode::AuthFailed) {
        SuggestedAction::AskUser
    } else {
        SuggestedAction::RetryWithGuidance
    };

    FailureSummary {
        category,
        retryable,
        suggested_action,
        last_error_code,
        last_error: last_error.map(|err| err.message.clone()),
        last_tool_results: recent_tool_results(trace),
        consecutive_failures,
        hint: None,
    }
}

fn recent_tool_results(trace: &RunTrace) -> Vec<ToolOutcomeSummary> {
    let start = trace.steps.len().saturating_sub(RECENT_STEPS);
    trace.steps[start..]
        .iter()
        .flat_map(|step| &step.tool_calls)
        .map(|call| ToolOutcomeSummary {
            tool: call.tool.clone(),
            ok: call.result.ok,
            output: truncate_chars(&call.result.output, OUTPUT_PREVIEW_CHARS),
        })
        .collect()
}

/// Truncate to `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ToolResult;
    use crate::run::{StepTrace, ToolInvocation};
    use chrono::Utc;
    use serde_json::json;

    fn step(iteration: u32, calls: &[(&str, ToolResult)]) -> StepTrace {
        StepTrace {
            iteration,
            timestamp: Utc::now(),
            model: "m".to_string(),
            tool_calls: calls
                .iter()
                .enumerate()
                .map(|(i, (tool, result))| ToolInvocation {
                    tool_call_id: format!("call-{iteration}-{i}"),
                    tool: tool.to_string(),
                    arguments: json!({}),
                    result: result.clone(),
                })
                .collect(),
        }
    }

    #[test]
    fn forced_budget_exhaustion_stops() {
        let summary = classify(
            &RunTrace::default(),
            0,
            None,
            Some(FailureCategory::BudgetExhausted),
        );
        assert_eq!(summary.category, FailureCategory::BudgetExhausted);
        assert!(!summary.retryable);
        assert_eq!(summary.suggested_action, SuggestedAction::Stop);
    }

    #[test]
    fn tool_error_is_tool_failure_with_guidance() {
        let err = TriggerError::tool(ErrorCode::NotFound, "no such file");
        let summary = classify(&RunTrace::default(), 3, Some(&err), None);
        assert_eq!(summary.category, FailureCategory::ToolFailure);
        assert!(summary.retryable);
        assert_eq!(summary.suggested_action, SuggestedAction::RetryWithGuidance);
        assert_eq!(summary.last_error_code, Some(ErrorCode::NotFound));
        assert_eq!(summary.consecutive_failures, 3);
    }

    #[test]
    fn auth_failure_asks_user() {
        let err = TriggerError::tool(ErrorCode::AuthFailed, "missing credential");
        let summary = classify(&RunTrace::default(), 3, Some(&err), None);
        assert_eq!(summary.suggested_action, SuggestedAction::AskUser);
    }

    #[test]
    fn no_error_is_unknown() {
        let summary = classify(&RunTrace::default(), 0, None, None);
        assert_eq!(summary.category, FailureCategory::Unknown);
        assert!(summary.retryable);

        let other = TriggerError::other("backend went away");
        let summary = classify(&RunTrace::default(), 0, Some(&other), None);
        assert_eq!(summary.category, FailureCategory::Unknown);
        assert_eq!(summary.last_error.as_deref(), Some("backend went away"));
    }

    #[test]
    fn keeps_only_last_two_steps_with_truncated_output() {
        let mut trace = RunTrace::default();
        trace.push(step(0, &[("read_file", ToolResult::success("old"))]));
        trace.push(step(
            1,
            &[("shell", ToolResult::success("x".repeat(500)))],
        ));
        trace.push(step(
            2,
            &[
                ("grep", ToolResult::error(ErrorCode::InvalidArgs, "bad", false)),
                ("list_dir", ToolResult::success("a\nb")),
            ],
        ));

        let summary = classify(&trace, 1, None, None);
        let tools: Vec<&str> = summary
            .last_tool_results
            .iter()
            .map(|r| r.tool.as_str())
            .collect();
        assert_eq!(tools, vec!["shell", "grep", "list_dir"]);
        assert_eq!(summary.last_tool_results[0].output.chars().count(), 201);
        assert!(!summary.last_tool_results[1].ok);
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé…");
        assert_eq!(truncate_chars("hi", 5), "hi");
    }
}
