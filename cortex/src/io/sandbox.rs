//! Sandboxed path resolution.
//!
//! Every filesystem tool resolves its path argument here before touching the
//! disk. A path is accepted only if its real location, after following every
//! symlink that exists today, lies under one of the canonicalized roots.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::core::types::{ErrorCode, ToolResult};

/// A path that passed the sandbox check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Real location (symlinks resolved for the existing part).
    pub path: PathBuf,
    /// Canonical root the path was validated against.
    pub root: PathBuf,
}

impl ResolvedPath {
    /// Path relative to its root, for display in tool output.
    pub fn display_relative(&self) -> String {
        match self.path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => self.path.display().to_string(),
        }
    }
}

/// Rejection of a path that would escape every allowed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub requested: String,
    pub reason: String,
}

impl Denied {
    fn new(requested: &str, reason: impl Into<String>) -> Self {
        Self {
            requested: requested.to_string(),
            reason: reason.into(),
        }
    }

    /// Non-retryable `permission_denied` result for the model.
    pub fn to_tool_result(&self) -> ToolResult {
        ToolResult::error(ErrorCode::PermissionDenied, self.to_string(), false)
    }
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "access to '{}' denied: {}. Only paths inside the workspace are allowed.",
            self.requested, self.reason
        )
    }
}

impl std::error::Error for Denied {}

/// Resolve `requested` against `roots`, returning the first root under which it validates.
pub fn resolve(roots: &[PathBuf], requested: &str) -> Result<ResolvedPath, Denied> {
    let usable: Vec<(&PathBuf, PathBuf)> = roots
        .iter()
        .filter_map(|root| match root.canonicalize() {
            Ok(canonical) => Some((root, canonical)),
            Err(err) => {
                debug!(root = %root.display(), err = %err, "skipping unusable sandbox root");
                None
            }
        })
        .collect();
    if usable.is_empty() {
        return Err(Denied::new(requested, "no accessible root"));
    }
    let canonical_roots: Vec<PathBuf> = usable.iter().map(|(_, c)| c.clone()).collect();

    let mut first_valid: Option<ResolvedPath> = None;
    let mut last_reason = "path escapes the allowed roots".to_string();
    for (root, canonical_root) in &usable {
        match resolve_under(root, canonical_root, &canonical_roots, requested) {
            Ok(path) => {
                let resolved = ResolvedPath {
                    path,
                    root: canonical_root.clone(),
                };
                // An existing target wins over a not-yet-created one under an earlier root.
                if resolved.path.exists() {
                    return Ok(resolved);
                }
                first_valid.get_or_insert(resolved);
            }
            Err(reason) => last_reason = reason,
        }
    }
    first_valid.ok_or_else(|| {
        debug!(requested, reason = %last_reason, "sandbox denied path");
        Denied::new(requested, last_reason)
    })
}

fn resolve_under(
    root: &Path,
    canonical_root: &Path,
    canonical_roots: &[PathBuf],
    requested: &str,
) -> Result<PathBuf, String> {
    let requested_path = Path::new(requested);
    let candidate = if requested_path.is_absolute() {
        let normalized = normalize_lexically(requested_path)
            .ok_or_else(|| "path escapes the filesystem root".to_string())?;
        // Absolute paths may name the root as configured or as canonicalized.
        let lexical_root = normalize_lexically(root).unwrap_or_else(|| root.to_path_buf());
        if let Ok(rest) = normalized.strip_prefix(&lexical_root) {
            canonical_root.join(rest)
        } else if normalized.starts_with(canonical_root) {
            normalized
        } else {
            return Err("absolute path outside the allowed roots".to_string());
        }
    } else {
        let normalized = normalize_lexically(&canonical_root.join(requested_path))
            .ok_or_else(|| "path escapes the allowed roots".to_string())?;
        if !normalized.starts_with(canonical_root) {
            return Err("path escapes the allowed roots".to_string());
        }
        normalized
    };

    let real = real_location(&candidate)?;
    if canonical_roots.iter().any(|r| real.starts_with(r)) {
        Ok(real)
    } else {
        Err("path resolves outside the allowed roots through a symlink".to_string())
    }
}

/// Follow symlinks for the part of `candidate` that exists.
fn real_location(candidate: &Path) -> Result<PathBuf, String> {
    if let Ok(meta) = fs::symlink_metadata(candidate) {
        return candidate.canonicalize().map_err(|_| {
            if meta.file_type().is_symlink() {
                "dangling symlink".to_string()
            } else {
                "path cannot be resolved".to_string()
            }
        });
    }

    for ancestor in candidate.ancestors().skip(1) {
        let Ok(meta) = fs::symlink_metadata(ancestor) else {
            continue;
        };
        let real_ancestor = ancestor.canonicalize().map_err(|_| {
            if meta.file_type().is_symlink() {
                "dangling symlink in parent path".to_string()
            } else {
                "parent path cannot be resolved".to_string()
            }
        })?;
        let rest = candidate
            .strip_prefix(ancestor)
            .map_err(|_| "path cannot be resolved".to_string())?;
        return Ok(real_ancestor.join(rest));
    }
    Err("path cannot be resolved".to_string())
}

/// Collapse `.` and `..` without touching the filesystem.
///
/// Returns `None` when `..` would climb above the path's root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    struct Sandbox {
        _temp: tempfile::TempDir,
        workspace: PathBuf,
        outside: PathBuf,
    }

    fn sandbox() -> Sandbox {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        let outside = temp.path().join("outside");
        fs::create_dir_all(workspace.join("sub")).expect("mkdir ws");
        fs::create_dir_all(&outside).expect("mkdir outside");
        fs::write(workspace.join("sub/file.txt"), "hi").expect("write");
        fs::write(outside.join("secret.txt"), "s").expect("write");
        Sandbox {
            _temp: temp,
            workspace,
            outside,
        }
    }

    #[test]
    fn resolves_existing_and_new_paths() {
        let sb = sandbox();
        let roots = vec![sb.workspace.clone()];
        let existing = resolve(&roots, "sub/file.txt").expect("existing");
        assert_eq!(existing.display_relative(), "sub/file.txt");

        let new = resolve(&roots, "new/dir/out.txt").expect("new file under missing dirs");
        assert_eq!(new.display_relative(), "new/dir/out.txt");

        let root = resolve(&roots, ".").expect("root");
        assert_eq!(root.display_relative(), ".");
    }

    #[test]
    fn dot_dot_inside_the_root_is_fine() {
        let sb = sandbox();
        let roots = vec![sb.workspace.clone()];
        let resolved = resolve(&roots, "sub/../sub/./file.txt").expect("resolve");
        assert_eq!(resolved.display_relative(), "sub/file.txt");
    }

    #[test]
    fn traversal_is_denied() {
        let sb = sandbox();
        let roots = vec![sb.workspace.clone()];
        for path in ["../outside/secret.txt", "sub/../../outside", "../../../../etc/passwd"] {
            let denied = resolve(&roots, path).unwrap_err();
            let result = denied.to_tool_result();
            assert_eq!(result.error_code, Some(ErrorCode::PermissionDenied));
            assert!(!result.retryable);
        }
    }

    #[test]
    fn absolute_paths_must_stay_inside() {
        let sb = sandbox();
        let roots = vec![sb.workspace.clone()];
        let inside = sb.workspace.join("sub/file.txt");
        assert!(resolve(&roots, &inside.display().to_string()).is_ok());
        let outside = sb.outside.join("secret.txt");
        assert!(resolve(&roots, &outside.display().to_string()).is_err());
        assert!(resolve(&roots, "/etc/passwd").is_err());
    }

    #[test]
    fn symlink_escape_is_denied() {
        let sb = sandbox();
        symlink(sb.outside.join("secret.txt"), sb.workspace.join("link")).expect("symlink");
        let roots = vec![sb.workspace.clone()];
        assert!(resolve(&roots, "link").is_err());
    }

    #[test]
    fn symlinked_ancestor_cannot_smuggle_new_files_out() {
        let sb = sandbox();
        symlink(&sb.outside, sb.workspace.join("escape")).expect("symlink");
        let roots = vec![sb.workspace.clone()];
        assert!(resolve(&roots, "escape/new.txt").is_err());
        assert!(resolve(&roots, "escape/deeper/missing/new.txt").is_err());
    }

    #[test]
    fn dangling_symlink_is_denied() {
        let sb = sandbox();
        symlink(sb.workspace.join("nowhere"), sb.workspace.join("dangling")).expect("symlink");
        let roots = vec![sb.workspace.clone()];
        let denied = resolve(&roots, "dangling").unwrap_err();
        assert!(denied.reason.contains("dangling"));
    }

    #[test]
    fn symlink_within_the_root_is_allowed() {
        let sb = sandbox();
        symlink(sb.workspace.join("sub"), sb.workspace.join("alias")).expect("symlink");
        let roots = vec![sb.workspace.clone()];
        let resolved = resolve(&roots, "alias/file.txt").expect("resolve");
        assert_eq!(resolved.display_relative(), "sub/file.txt");
    }

    #[test]
    fn falls_back_to_later_roots() {
        let sb = sandbox();
        let roots = vec![sb.workspace.clone(), sb.outside.clone()];
        let resolved = resolve(&roots, "secret.txt").expect("second root");
        assert_eq!(resolved.root, sb.outside.canonicalize().expect("canonical"));
    }

    #[test]
    fn new_paths_resolve_under_the_first_root() {
        let sb = sandbox();
        let roots = vec![sb.workspace.clone(), sb.outside.clone()];
        let resolved = resolve(&roots, "fresh.txt").expect("resolve");
        assert_eq!(resolved.root, sb.workspace.canonicalize().expect("canonical"));
    }

    #[test]
    fn normalize_rejects_climbing_above_root() {
        assert_eq!(normalize_lexically(Path::new("/a/../..")), None);
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            Some(PathBuf::from("/a/c"))
        );
    }
}
