//! Run persistence.
//!
//! Runs are saved whole after every iteration and before every pause, which
//! is what makes attempts resumable across process restarts.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, warn};

use crate::core::types::RunStatus;
use crate::run::Run;

/// Selection for [`StateStore::list_runs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.status.is_none_or(|status| run.status == status)
    }
}

/// Storage for run records. Callers pass the handle explicitly.
pub trait StateStore: Send + Sync {
    fn create_run(&self, run: &Run) -> Result<()>;

    fn update_run(&self, run: &Run) -> Result<()>;

    fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Matching runs, newest first.
    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Newest run that is running or waiting on a human.
    fn get_active_run(&self) -> Result<Option<Run>> {
        Ok(self
            .list_runs(&RunFilter::default())?
            .into_iter()
            .find(|run| run.status.is_active()))
    }
}

/// One pretty-printed JSON file per run under `<state_dir>/runs/`.
#[derive(Debug)]
pub struct FileStateStore {
    runs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            runs_dir: state_dir.join("runs"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn run_path(&self, id: &str) -> Result<PathBuf> {
        validate_run_id(id)?;
        Ok(self.runs_dir.join(format!("{id}.json")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))
    }
}

impl StateStore for FileStateStore {
    fn create_run(&self, run: &Run) -> Result<()> {
        let path = self.run_path(&run.id)?;
        let _guard = self.lock()?;
        if path.exists() {
            bail!("run {} already exists", run.id);
        }
        write_run(&path, run)
    }

    fn update_run(&self, run: &Run) -> Result<()> {
        let path = self.run_path(&run.id)?;
        let _guard = self.lock()?;
        if !path.exists() {
            bail!("run {} does not exist", run.id);
        }
        write_run(&path, run)
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let path = self.run_path(id)?;
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let run = serde_json::from_str(&contents)
                    .with_context(|| format!("parse run {}", path.display()))?;
                Ok(Some(run))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read run {}", path.display())),
        }
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let entries = match fs::read_dir(&self.runs_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read directory {}", self.runs_dir.display()));
            }
        };

        let mut runs = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read directory {}", self.runs_dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read run {}", path.display()))?;
            match serde_json::from_str::<Run>(&contents) {
                Ok(run) if filter.matches(&run) => runs.push(run),
                Ok(_) => {}
                Err(err) => warn!(
                    path = %path.display(),
                    err = %err,
                    "skipping unreadable run record"
                ),
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }
}

fn validate_run_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        bail!("invalid run id '{id}'");
    }
    Ok(())
}

fn write_run(path: &Path, run: &Run) -> Result<()> {
    debug!(path = %path.display(), run_id = %run.id, status = %run.status, "writing run");
    let mut buf = serde_json::to_string_pretty(run).context("serialize run")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run {}", path.display()))?;
    Ok(())
}
