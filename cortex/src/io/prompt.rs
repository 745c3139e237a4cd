//! Prompt rendering for the attempt loop.
//!
//! Only the data contract matters here: which facts reach the model. Wording
//! lives in the templates under `prompts/`.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{FailureSummary, ToolOutcomeSummary};
use crate::run::RecoveryContext;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const FAILURE_HINT_TEMPLATE: &str = include_str!("prompts/failure_hint.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("system", SYSTEM_TEMPLATE)
        .expect("system template should be valid");
    env.add_template("failure_hint", FAILURE_HINT_TEMPLATE)
        .expect("failure hint template should be valid");
    env
});

/// Facts rendered into an attempt's system prompt.
#[derive(Debug, Clone, Default)]
pub struct SystemPromptInput<'a> {
    pub task: &'a str,
    /// Granted tools followed by the synthetic tools.
    pub tools: Vec<String>,
    pub domains: Option<&'a [String]>,
    /// Registered credential names; never values.
    pub credentials: Vec<String>,
    pub skills: Vec<String>,
    pub recovery: Option<&'a RecoveryContext>,
}

#[derive(Debug, Serialize)]
struct RecoveryView<'a> {
    previous_attempt_index: u32,
    category: &'static str,
    last_error: Option<&'a str>,
    guidance: &'a str,
}

pub fn render_system_prompt(input: &SystemPromptInput<'_>) -> Result<String> {
    let recovery = input.recovery.map(|r| RecoveryView {
        previous_attempt_index: r.previous_attempt_index,
        category: r.failure.category.as_str(),
        last_error: r.failure.last_error.as_deref(),
        guidance: r.guidance.trim(),
    });
    let rendered = ENGINE.get_template("system")?.render(context! {
        task => input.task.trim(),
        tools => input.tools,
        domains => input.domains,
        credentials => input.credentials,
        skills => input.skills,
        recovery => recovery,
    })?;
    debug!(bytes = rendered.len(), "rendered system prompt");
    Ok(rendered)
}

pub fn render_failure_hint_prompt(task: &str, failure: &FailureSummary) -> Result<String> {
    let recent: &[ToolOutcomeSummary] = &failure.last_tool_results;
    let rendered = ENGINE.get_template("failure_hint")?.render(context! {
        task => task.trim(),
        category => failure.category.as_str(),
        last_error => failure.last_error.as_deref(),
        recent => recent,
    })?;
    Ok(rendered)
}

/// Names of skill directories (those holding a `SKILL.md`) under `skills_dir`.
pub fn available_skills(skills_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(skills_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().join("SKILL.md").is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
