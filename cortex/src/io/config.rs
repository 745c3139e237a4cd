//! Runtime configuration stored as `cortex.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::credentials::DEFAULT_MIN_REDACTION_LEN;
use crate::core::failure_tracker::DEFAULT_FAILURE_THRESHOLD;
use crate::io::model::RetryPolicy;
use crate::io::tools::ToolLimits;

/// Runtime configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values; relative paths are
/// taken relative to the process working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CortexConfig {
    /// Run records live under `<state_dir>/runs/`.
    pub state_dir: PathBuf,
    /// One sandbox directory per attempt is created here.
    pub workspaces_dir: PathBuf,
    /// Completed runs copy their workspace to `<artifacts_dir>/<run_id>/`.
    pub artifacts_dir: PathBuf,
    /// Optional read-only skills directory exposed to tools.
    pub skills_dir: Option<PathBuf>,
    /// Extracted skills land in `<skills_output_dir>/<name>/`.
    pub skills_output_dir: PathBuf,
    /// JSONL file receiving run events.
    pub events_path: PathBuf,
    /// TOML file with a `[credentials]` table.
    pub credentials_file: Option<PathBuf>,

    #[serde(rename = "loop")]
    pub loop_: LoopSettings,
    pub model: ModelSettings,
    pub tools: ToolSettings,
    pub network: NetworkSettings,
    pub energy: EnergySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub max_attempts: u32,
    /// Identical consecutive tool failures that fail an attempt.
    pub failure_threshold: u32,
    pub max_tokens: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_attempts: 3,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelSettings {
    /// Helper command speaking the request/response JSON protocol on stdin/stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Tries per request, first included.
    pub max_tries: u32,
    /// Base backoff; retry `n` waits `backoff_ms * n`.
    pub backoff_ms: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
            max_tries: 3,
            backoff_ms: 1_000,
        }
    }
}

impl ModelSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_tries: self.max_tries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolSettings {
    pub timeout_secs: u64,
    /// Tool output beyond this many bytes is truncated with a notice.
    pub output_limit_bytes: usize,
    /// Secrets shorter than this are not redacted.
    pub redaction_min_len: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            output_limit_bytes: 50_000,
            redaction_min_len: DEFAULT_MIN_REDACTION_LEN,
        }
    }
}

impl ToolSettings {
    pub fn limits(&self) -> ToolLimits {
        ToolLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkSettings {
    /// Helper for `fetch`; the tool is unavailable when empty.
    pub fetch_command: Vec<String>,
    /// Helper for `search`; the tool is unavailable when empty.
    pub search_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnergySettings {
    pub per_model_call: f64,
    pub per_tool_call: f64,
}

impl Default for EnergySettings {
    fn default() -> Self {
        Self {
            per_model_call: 1.0,
            per_tool_call: 0.1,
        }
    }
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".cortex/state"),
            workspaces_dir: PathBuf::from(".cortex/workspaces"),
            artifacts_dir: PathBuf::from(".cortex/artifacts"),
            skills_dir: None,
            skills_output_dir: PathBuf::from(".cortex/skills"),
            events_path: PathBuf::from(".cortex/events.jsonl"),
            credentials_file: None,
            loop_: LoopSettings::default(),
            model: ModelSettings::default(),
            tools: ToolSettings::default(),
            network: NetworkSettings::default(),
            energy: EnergySettings::default(),
        }
    }
}

impl CortexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.loop_.max_iterations == 0 {
            return Err(anyhow!("loop.max_iterations must be > 0"));
        }
        if self.loop_.max_attempts == 0 {
            return Err(anyhow!("loop.max_attempts must be > 0"));
        }
        if self.loop_.failure_threshold == 0 {
            return Err(anyhow!("loop.failure_threshold must be > 0"));
        }
        if self.loop_.max_tokens == 0 {
            return Err(anyhow!("loop.max_tokens must be > 0"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.max_tries == 0 {
            return Err(anyhow!("model.max_tries must be > 0"));
        }
        if self.tools.timeout_secs == 0 {
            return Err(anyhow!("tools.timeout_secs must be > 0"));
        }
        if self.tools.output_limit_bytes == 0 {
            return Err(anyhow!("tools.output_limit_bytes must be > 0"));
        }
        if self.tools.redaction_min_len == 0 {
            return Err(anyhow!("tools.redaction_min_len must be > 0"));
        }
        if self.energy.per_model_call < 0.0 || self.energy.per_tool_call < 0.0 {
            return Err(anyhow!("energy costs must not be negative"));
        }
        Ok(())
    }

    /// Model helper command, or an error telling the operator how to set it.
    pub fn model_command(&self) -> Result<&[String]> {
        match self.model.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(&self.model.command),
            _ => Err(anyhow!(
                "model.command is not configured; set it to a helper that speaks the completion JSON protocol"
            )),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CortexConfig::default()`.
pub fn load_config(path: &Path) -> Result<CortexConfig> {
    if !path.exists() {
        let cfg = CortexConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CortexConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CortexConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CortexConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cortex.toml");
        let mut cfg = CortexConfig::default();
        cfg.skills_dir = Some(PathBuf::from("skills"));
        cfg.model.command = vec!["model-helper".to_string(), "--json".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cortex.toml");
        fs::write(&path, "[loop]\nmax_iterations = 7\n\n[energy]\nper_tool_call = 0.5\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.loop_.max_iterations, 7);
        assert_eq!(cfg.loop_.max_attempts, 3);
        assert_eq!(cfg.energy.per_tool_call, 0.5);
        assert_eq!(cfg.energy.per_model_call, 1.0);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cortex.toml");
        fs::write(&path, "[tools]\noutput_limit_bytes = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("output_limit_bytes"));
    }

    #[test]
    fn missing_model_command_is_reported() {
        let cfg = CortexConfig::default();
        assert!(cfg.model_command().is_err());
    }
}
