//! Pure state transitions for resuming a paused attempt.

use anyhow::{Context, Result, bail};

use crate::core::credentials::Redactor;
use crate::core::types::AttemptStatus;
use crate::run::{Message, Role, Run};

/// Human input delivered to a paused attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeInput {
    /// Answer to an `ask_user` question.
    Answer(String),
    /// Decision on a `request_approval` action.
    Approval { approved: bool, note: Option<String> },
}

impl ResumeInput {
    fn expected_status(&self) -> AttemptStatus {
        match self {
            ResumeInput::Answer(_) => AttemptStatus::AwaitingInput,
            ResumeInput::Approval { .. } => AttemptStatus::AwaitingApproval,
        }
    }

    fn tool_message(&self) -> String {
        match self {
            ResumeInput::Answer(answer) => format!("User answered: {answer}"),
            ResumeInput::Approval { approved, note } => {
                let decision = if *approved {
                    "Approved. You may proceed with the action."
                } else {
                    "Denied. Do not perform the action; continue without it or finish."
                };
                match note.as_deref().filter(|n| !n.trim().is_empty()) {
                    Some(note) => format!("{decision} Note from user: {note}"),
                    None => decision.to_string(),
                }
            }
        }
    }
}

/// Result of applying a resume input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeApplied {
    /// The attempt was paused and is running again.
    Resumed,
    /// The attempt was not paused; nothing changed.
    NotPaused,
}

const NOT_EXECUTED: &str =
    "Not executed: the turn paused for human input before this call ran. Re-issue it if still needed.";

/// Deliver `input` to the run's paused attempt.
///
/// Appends the answer as the tool result of the pending call, fills "not
/// executed" results for calls the pause skipped, clears pending markers and
/// marks the attempt running. `step_cursor` is left untouched.
pub fn apply_resume(
    run: &mut Run,
    input: &ResumeInput,
    redactor: &Redactor,
) -> Result<ResumeApplied> {
    let run_id = run.id.clone();
    let attempt = run
        .current_attempt_mut()
        .with_context(|| format!("run {run_id} has no attempt to resume"))?;

    if !attempt.is_paused() {
        return Ok(ResumeApplied::NotPaused);
    }
    if attempt.status != input.expected_status() {
        bail!(
            "run {run_id} is {:?}, which does not accept this kind of input",
            attempt.status
        );
    }
    let pending_id = attempt
        .pending_tool_call_id
        .clone()
        .with_context(|| format!("paused attempt of run {run_id} has no pending tool call"))?;

    let skipped: Vec<String> = attempt
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == pending_id))
        .map(|m| {
            m.tool_calls
                .iter()
                .skip_while(|c| c.id != pending_id)
                .skip(1)
                .map(|c| c.id.clone())
                .collect()
        })
        .unwrap_or_default();

    attempt
        .messages
        .push(Message::tool(&pending_id, redactor.redact(&input.tool_message())));
    for id in skipped {
        attempt.messages.push(Message::tool(id, NOT_EXECUTED));
    }
    attempt.clear_pending();
    attempt.status = AttemptStatus::Running;
    run.sync_status();
    Ok(ResumeApplied::Resumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunStatus;
    use crate::run::ToolCall;
    use serde_json::json;

    fn paused_run(status: AttemptStatus) -> Run {
        let mut run = Run::new("run-1", "task", vec!["read_file".to_string()], None, 2);
        let attempt = run.start_attempt(5, None).expect("start");
        attempt.messages.push(Message::assistant(
            "",
            vec![
                ToolCall {
                    id: "c1".to_string(),
                    name: "ask_user".to_string(),
                    arguments: json!({"question": "which file?"}),
                },
                ToolCall {
                    id: "c2".to_string(),
                    name: "read_file".to_string(),
                    arguments: json!({"path": "a"}),
                },
            ],
        ));
        attempt.status = status;
        attempt.step_cursor = 1;
        attempt.pending_tool_call_id = Some("c1".to_string());
        attempt.pending_question = Some("which file?".to_string());
        run.sync_status();
        run
    }

    #[test]
    fn answer_resumes_and_fills_skipped_calls() {
        let mut run = paused_run(AttemptStatus::AwaitingInput);
        let applied = apply_resume(
            &mut run,
            &ResumeInput::Answer("notes.txt".to_string()),
            &Redactor::default(),
        )
        .expect("resume");
        assert_eq!(applied, ResumeApplied::Resumed);
        assert_eq!(run.status, RunStatus::Running);

        let attempt = run.current_attempt().expect("attempt");
        assert_eq!(attempt.step_cursor, 1);
        assert!(attempt.pending_question.is_none());
        assert!(attempt.pending_tool_call_id.is_none());
        let tail: Vec<(&str, &str)> = attempt.messages[1..]
            .iter()
            .map(|m| (m.tool_call_id.as_deref().unwrap_or(""), m.content.as_str()))
            .collect();
        assert_eq!(tail[0], ("c1", "User answered: notes.txt"));
        assert_eq!(tail[1].0, "c2");
        assert!(tail[1].1.starts_with("Not executed"));
    }

    #[test]
    fn resuming_twice_equals_once() {
        let input = ResumeInput::Answer("yes".to_string());
        let mut once = paused_run(AttemptStatus::AwaitingInput);
        apply_resume(&mut once, &input, &Redactor::default()).expect("resume");

        let mut twice = once.clone();
        let applied = apply_resume(&mut twice, &input, &Redactor::default()).expect("resume");
        assert_eq!(applied, ResumeApplied::NotPaused);
        assert_eq!(once, twice);
    }

    #[test]
    fn wrong_input_kind_is_rejected() {
        let mut run = paused_run(AttemptStatus::AwaitingApproval);
        let err = apply_resume(
            &mut run,
            &ResumeInput::Answer("hi".to_string()),
            &Redactor::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not accept"));
        assert_eq!(run.status, RunStatus::AwaitingApproval);
    }

    #[test]
    fn denial_with_note_is_recorded() {
        let mut run = paused_run(AttemptStatus::AwaitingApproval);
        apply_resume(
            &mut run,
            &ResumeInput::Approval {
                approved: false,
                note: Some("too risky".to_string()),
            },
            &Redactor::default(),
        )
        .expect("resume");
        let attempt = run.current_attempt().expect("attempt");
        let reply = &attempt.messages[1].content;
        assert!(reply.starts_with("Denied."));
        assert!(reply.contains("too risky"));
    }

    #[test]
    fn answer_is_redacted() {
        let mut run = paused_run(AttemptStatus::AwaitingInput);
        let redactor = Redactor::new(["hunter22secret".to_string()], 6);
        apply_resume(
            &mut run,
            &ResumeInput::Answer("my password is hunter22secret".to_string()),
            &redactor,
        )
        .expect("resume");
        let attempt = run.current_attempt().expect("attempt");
        assert!(!attempt.messages[1].content.contains("hunter22secret"));
    }
}
