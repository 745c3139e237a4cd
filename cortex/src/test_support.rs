//! Test-only fakes for the loop's collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::attempt::{LoopConfig, LoopDeps, begin_attempt};
use crate::core::credentials::CredentialStore;
use crate::io::container::{ContainerHandle, ExecOutput, ExecRequest, exec_local};
use crate::io::ids::generate_run_id;
use crate::io::model::{
    CompletionRequest, CompletionResponse, ModelBackend, ModelError, ModelRole, RawToolCall,
};
use crate::io::signals::{RunEvent, SignalSink};
use crate::io::state_store::{RunFilter, StateStore};
use crate::run::Run;

/// Model turn with plain text and no tool calls.
pub fn reply(content: &str) -> CompletionResponse {
    CompletionResponse {
        content: content.to_string(),
        tool_calls: Vec::new(),
        finish_reason: Some("stop".to_string()),
        model: "scripted".to_string(),
    }
}

/// Model turn requesting the given `(id, tool, arguments)` calls in order.
pub fn tool_calls(calls: &[(&str, &str, Value)]) -> CompletionResponse {
    CompletionResponse {
        content: String::new(),
        tool_calls: calls
            .iter()
            .map(|(id, name, arguments)| RawToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.clone(),
            })
            .collect(),
        finish_reason: Some("tool_calls".to_string()),
        model: "scripted".to_string(),
    }
}

/// Backend replaying a fixed script of motor turns.
///
/// Failure-hint requests are answered from `hint` and never consume the script.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<CompletionResponse, ModelError>>>,
    hint: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<CompletionResponse, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            hint: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(turns: Vec<CompletionResponse>) -> Self {
        Self::new(turns.into_iter().map(Ok).collect())
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_string());
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn motor_requests(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.role == ModelRole::Motor)
            .count()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl ModelBackend for ScriptedModel {
    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ModelError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if request.role == ModelRole::FailureHint {
            return match &self.hint {
                Some(hint) => Ok(reply(hint)),
                None => Err(ModelError::Fatal("no hint scripted".to_string())),
            };
        }
        let mut script = self
            .script
            .lock()
            .map_err(|_| ModelError::Fatal("script lock poisoned".to_string()))?;
        script
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Fatal("script exhausted".to_string())))
    }
}

/// Sink keeping every emitted event.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl SignalSink for RecordingSink {
    fn emit(&self, event: &RunEvent) -> Result<()> {
        match self.events.lock() {
            Ok(mut events) => {
                events.push(event.clone());
                Ok(())
            }
            Err(_) => bail!("recording sink lock poisoned"),
        }
    }
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    runs: Mutex<BTreeMap<String, Run>>,
}

impl StateStore for MemoryStateStore {
    fn create_run(&self, run: &Run) -> Result<()> {
        let Ok(mut runs) = self.runs.lock() else {
            bail!("memory store lock poisoned");
        };
        if runs.contains_key(&run.id) {
            bail!("run {} already exists", run.id);
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn update_run(&self, run: &Run) -> Result<()> {
        let Ok(mut runs) = self.runs.lock() else {
            bail!("memory store lock poisoned");
        };
        match runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => bail!("run {} does not exist", run.id),
        }
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let Ok(runs) = self.runs.lock() else {
            bail!("memory store lock poisoned");
        };
        Ok(runs.get(id).cloned())
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let Ok(runs) = self.runs.lock() else {
            bail!("memory store lock poisoned");
        };
        let mut matching: Vec<Run> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

/// Container running commands locally and recording delivered credentials.
#[derive(Debug, Default)]
pub struct RecordingContainer {
    delivered: Mutex<Vec<(String, String)>>,
}

impl RecordingContainer {
    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl ContainerHandle for RecordingContainer {
    fn deliver_credential(&self, name: &str, value: &str) -> Result<()> {
        match self.delivered.lock() {
            Ok(mut delivered) => {
                delivered.push((name.to_string(), value.to_string()));
                Ok(())
            }
            Err(_) => bail!("container lock poisoned"),
        }
    }

    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        exec_local(request)
    }
}

/// Temp directory plus in-memory collaborators for loop tests.
pub struct Harness {
    pub temp: tempfile::TempDir,
    pub model: ScriptedModel,
    pub store: MemoryStateStore,
    pub sink: RecordingSink,
    pub credentials: CredentialStore,
    pub cfg: LoopConfig,
}

impl Harness {
    pub fn new(model: ScriptedModel) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let mut cfg = LoopConfig::rooted_at(temp.path());
        cfg.retry.backoff = std::time::Duration::from_millis(1);
        Ok(Self {
            temp,
            model,
            store: MemoryStateStore::default(),
            sink: RecordingSink::default(),
            credentials: CredentialStore::new(),
            cfg,
        })
    }

    pub fn deps(&self) -> LoopDeps<'_> {
        LoopDeps::new(&self.model, &self.store, &self.sink, &self.credentials)
    }

    /// Create and store a run with a prepared first attempt, without running it.
    pub fn prepare(&self, task: &str, tools: &[&str]) -> Result<Run> {
        let mut run = Run::new(
            generate_run_id(),
            task,
            tools.iter().map(|tool| tool.to_string()),
            None,
            self.cfg.max_attempts,
        );
        begin_attempt(&mut run, &self.deps(), &self.cfg, None)?;
        self.store.create_run(&run)?;
        Ok(run)
    }

    /// Workspace of the current attempt of `run`.
    pub fn workspace(&self, run: &Run) -> Option<PathBuf> {
        run.current_attempt().and_then(|a| a.workspace.clone())
    }
}
