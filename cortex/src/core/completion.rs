//! Heuristics for a model turn that requested no tool calls.

use std::sync::LazyLock;

use regex::Regex;

/// Markup models emit when they imitate a tool call in plain text instead of
/// issuing a real one.
static FAKE_TOOL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?xis)
        </?(tool_call|tool_use|function_call|function_calls|invoke|tool)\b
        | ```\s*(tool_code|tool_call|json\s*\{\s*"(name|tool)"\s*:)
        | \{\s*"(name|tool|tool_name)"\s*:\s*"[a-z_]+"\s*,\s*"(arguments|parameters|args|input)"\s*:
        "#,
    )
    .expect("fake tool call regex should be valid")
});

/// How a tool-less model turn is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// The model finished the task.
    Completion,
    /// The model gave up or faked a tool call after tool errors.
    Degenerate,
}

/// Classify a turn with no tool calls.
///
/// Only degenerate when the attempt has recorded tool errors and the reply is
/// empty or looks like hallucinated tool-call syntax.
pub fn classify_stop(reply: &str, had_tool_errors: bool) -> StopKind {
    if had_tool_errors && (reply.trim().is_empty() || looks_like_fake_tool_call(reply)) {
        StopKind::Degenerate
    } else {
        StopKind::Completion
    }
}

pub fn looks_like_fake_tool_call(reply: &str) -> bool {
    FAKE_TOOL_CALL_RE.is_match(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_summary_is_completion_even_after_errors() {
        assert_eq!(
            classify_stop("Wrote report.md with the totals.", true),
            StopKind::Completion
        );
    }

    #[test]
    fn empty_reply_without_errors_is_completion() {
        assert_eq!(classify_stop("", false), StopKind::Completion);
    }

    #[test]
    fn empty_reply_after_errors_is_degenerate() {
        assert_eq!(classify_stop("  \n", true), StopKind::Degenerate);
    }

    #[test]
    fn detects_common_fake_tool_call_shapes() {
        for reply in [
            "<tool_call>{\"name\": \"read_file\"}</tool_call>",
            "I'll run <function_calls><invoke name=\"shell\">",
            "```tool_code\nprint(1)\n```",
            "{\"name\": \"read_file\", \"arguments\": {\"path\": \"a\"}}",
        ] {
            assert!(looks_like_fake_tool_call(reply), "missed: {reply}");
            assert_eq!(classify_stop(reply, true), StopKind::Degenerate);
        }
    }

    #[test]
    fn prose_mentioning_tools_is_not_fake() {
        assert!(!looks_like_fake_tool_call(
            "I used the read_file tool and found the answer: 42."
        ));
    }
}
