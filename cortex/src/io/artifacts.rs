//! Artifact persistence and skill extraction on completion.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Workspace subdirectory holding skills written by the agent.
pub const SKILLS_SUBDIR: &str = "skills";
const SKILL_FILE: &str = "SKILL.md";

/// Copy every regular workspace file to `<artifacts_dir>/<run_id>/`.
///
/// Returns the copied paths relative to the workspace, sorted. Symlinks are skipped.
pub fn persist_artifacts(
    workspace: &Path,
    artifacts_dir: &Path,
    run_id: &str,
) -> Result<Vec<String>> {
    let dest_root = artifacts_dir.join(run_id);
    let copied = copy_tree(workspace, &dest_root)?;
    info!(run_id, count = copied.len(), dest = %dest_root.display(), "persisted artifacts");
    Ok(copied)
}

/// Copy each `skills/<name>/` directory containing a `SKILL.md` to `<skills_output_dir>/<name>/`.
///
/// Returns the extracted skill names, sorted.
pub fn extract_skills(workspace: &Path, skills_output_dir: &Path) -> Result<Vec<String>> {
    let skills_root = workspace.join(SKILLS_SUBDIR);
    let entries = match fs::read_dir(&skills_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read directory {}", skills_root.display()));
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read directory {}", skills_root.display()))?;
        let file_type = entry.file_type().context("read skill entry type")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !file_type.is_dir() || !valid_skill_name(&name) {
            continue;
        }
        if !entry.path().join(SKILL_FILE).is_file() {
            debug!(skill = %name, "skipping skill directory without SKILL.md");
            continue;
        }
        copy_tree(&entry.path(), &skills_output_dir.join(&name))
            .with_context(|| format!("extract skill {name}"))?;
        names.push(name);
    }
    names.sort();
    if !names.is_empty() {
        info!(skills = ?names, "extracted skills");
    }
    Ok(names)
}

fn valid_skill_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn copy_tree(src: &Path, dest: &Path) -> Result<Vec<String>> {
    let mut copied = Vec::new();
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(err = %err, "skipping unreadable workspace entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::copy(entry.path(), &target)
            .with_context(|| format!("copy {} to {}", entry.path().display(), target.display()))?;
        copied.push(rel.display().to_string());
    }
    Ok(copied)
}
