//! Run transition events for the host platform.
//!
//! Exactly one event is emitted per terminal or pause transition.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::types::{FailureSummary, TaskResult};
use crate::run::PendingApproval;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Completed { result: TaskResult },
    AwaitingInput { question: String, tool_call_id: String },
    AwaitingApproval { approval: PendingApproval, tool_call_id: String },
    Failed { failure: FailureSummary },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Completed { .. } => "completed",
            EventPayload::AwaitingInput { .. } => "awaiting_input",
            EventPayload::AwaitingApproval { .. } => "awaiting_approval",
            EventPayload::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub attempt_index: u32,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl RunEvent {
    pub fn new(run_id: impl Into<String>, attempt_index: u32, payload: EventPayload) -> Self {
        Self {
            run_id: run_id.into(),
            attempt_index,
            at: Utc::now(),
            payload,
        }
    }
}

pub trait SignalSink: Send + Sync {
    fn emit(&self, event: &RunEvent) -> Result<()>;
}

/// Reports events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl SignalSink for LogSink {
    fn emit(&self, event: &RunEvent) -> Result<()> {
        info!(
            run_id = %event.run_id,
            attempt = event.attempt_index,
            kind = event.payload.kind(),
            "run event"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to an events file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl SignalSink for JsonlSink {
    fn emit(&self, event: &RunEvent) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("event sink lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("serialize run event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open events file {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))?;
        Ok(())
    }
}

/// Forwards each event to every inner sink, stopping at the first error.
pub struct FanoutSink {
    sinks: Vec<Box<dyn SignalSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn SignalSink>>) -> Self {
        Self { sinks }
    }
}

impl SignalSink for FanoutSink {
    fn emit(&self, event: &RunEvent) -> Result<()> {
        for sink in &self.sinks {
            sink.emit(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_flat_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/events.jsonl");
        let sink = JsonlSink::new(path.clone());
        sink.emit(&RunEvent::new(
            "run_1",
            0,
            EventPayload::AwaitingInput {
                question: "which file?".to_string(),
                tool_call_id: "c1".to_string(),
            },
        ))
        .expect("emit");
        sink.emit(&RunEvent::new(
            "run_1",
            0,
            EventPayload::Completed {
                result: TaskResult {
                    summary: "done".to_string(),
                    artifacts: Vec::new(),
                    skills: Vec::new(),
                },
            },
        ))
        .expect("emit");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "awaiting_input");
        assert_eq!(lines[0]["question"], "which file?");
        assert_eq!(lines[1]["kind"], "completed");
        assert_eq!(lines[1]["run_id"], "run_1");

        let parsed: RunEvent =
            serde_json::from_str(contents.lines().next().expect("line")).expect("parse");
        assert_eq!(parsed.payload.kind(), "awaiting_input");
    }
}
