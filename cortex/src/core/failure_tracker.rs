//! Consecutive identical failure tracking.
//!
//! Two failures are "the same" only when tool name, error code and the
//! serialized (unresolved) arguments all match. Any success resets the streak.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::json_walk::canonical_string;
use crate::core::types::{ErrorCode, ToolResult};

/// Default number of identical failures that fails an attempt.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Current run of identical failures. Persisted with the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStreak {
    pub tool: String,
    pub error_code: ErrorCode,
    pub arguments: String,
    pub count: u32,
}

impl FailureStreak {
    fn matches(&self, tool: &str, error_code: ErrorCode, arguments: &str) -> bool {
        self.tool == tool && self.error_code == error_code && self.arguments == arguments
    }
}

/// Fold one tool result into the streak and return the updated streak length.
///
/// Returns 0 after a success.
pub fn record_outcome(
    streak: &mut Option<FailureStreak>,
    tool: &str,
    arguments: &Value,
    result: &ToolResult,
) -> u32 {
    let Some(error_code) = result.error_code.filter(|_| !result.ok) else {
        *streak = None;
        return 0;
    };
    let arguments = canonical_string(arguments);

    match streak {
        Some(current) if current.matches(tool, error_code, &arguments) => {
            current.count += 1;
            current.count
        }
        _ => {
            *streak = Some(FailureStreak {
                tool: tool.to_string(),
                error_code,
                arguments,
                count: 1,
            });
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn not_found() -> ToolResult {
        ToolResult::error(ErrorCode::NotFound, "missing", false)
    }

    #[test]
    fn identical_failures_accumulate() {
        let mut streak = None;
        let args = json!({"path": "a.txt"});
        assert_eq!(record_outcome(&mut streak, "read_file", &args, &not_found()), 1);
        assert_eq!(record_outcome(&mut streak, "read_file", &args, &not_found()), 2);
        assert_eq!(record_outcome(&mut streak, "read_file", &args, &not_found()), 3);
    }

    #[test]
    fn different_arguments_restart_the_streak() {
        let mut streak = None;
        record_outcome(&mut streak, "read_file", &json!({"path": "a"}), &not_found());
        record_outcome(&mut streak, "read_file", &json!({"path": "a"}), &not_found());
        let count = record_outcome(&mut streak, "read_file", &json!({"path": "b"}), &not_found());
        assert_eq!(count, 1);
    }

    #[test]
    fn different_error_code_restarts_the_streak() {
        let mut streak = None;
        let args = json!({"path": "a"});
        record_outcome(&mut streak, "read_file", &args, &not_found());
        let denied = ToolResult::error(ErrorCode::PermissionDenied, "no", false);
        assert_eq!(record_outcome(&mut streak, "read_file", &args, &denied), 1);
    }

    #[test]
    fn success_resets() {
        let mut streak = None;
        let args = json!({"path": "a"});
        record_outcome(&mut streak, "read_file", &args, &not_found());
        assert_eq!(
            record_outcome(&mut streak, "read_file", &args, &ToolResult::success("x")),
            0
        );
        assert!(streak.is_none());
        assert_eq!(record_outcome(&mut streak, "read_file", &args, &not_found()), 1);
    }

    #[test]
    fn key_order_does_not_matter() {
        let mut streak = None;
        record_outcome(
            &mut streak,
            "fetch",
            &json!({"url": "u", "method": "GET"}),
            &not_found(),
        );
        let count = record_outcome(
            &mut streak,
            "fetch",
            &json!({"method": "GET", "url": "u"}),
            &not_found(),
        );
        assert_eq!(count, 2);
    }
}
