//! `grep`: regex search over sandboxed files.

use std::fs;

use regex::Regex;
use walkdir::WalkDir;

use super::{ToolContext, ToolOutcome, invalid, not_found};
use crate::core::tool_args::GrepArgs;
use crate::io::sandbox::resolve;

const DEFAULT_MAX_RESULTS: usize = 100;
const MAX_LINE_CHARS: usize = 300;

pub(super) fn grep(args: &GrepArgs, ctx: &ToolContext) -> ToolOutcome {
    let pattern = Regex::new(&args.pattern)
        .map_err(|err| invalid(format!("invalid regex '{}': {err}", args.pattern)))?;
    let requested = args.path.as_deref().unwrap_or(".");
    let target = resolve(&ctx.allowed_roots, requested).map_err(|d| d.to_tool_result())?;
    if !target.path.exists() {
        return Err(not_found(format!("path '{requested}' does not exist")));
    }
    let max_results = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

    let mut matches = Vec::new();
    let mut truncated = false;
    let walker = WalkDir::new(&target.path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    'files: for entry in walker.filter_map(Result::ok) {
        // Symlinks are never followed: their targets were not sandbox-checked.
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        let Ok(contents) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let display = entry
            .path()
            .strip_prefix(&target.root)
            .unwrap_or(entry.path())
            .display()
            .to_string();
        for (idx, line) in contents.lines().enumerate() {
            if !pattern.is_match(line) {
                continue;
            }
            if matches.len() >= max_results {
                truncated = true;
                break 'files;
            }
            let line: String = line.chars().take(MAX_LINE_CHARS).collect();
            matches.push(format!("{display}:{}: {line}", idx + 1));
        }
    }

    if matches.is_empty() {
        return Ok(format!("No matches for /{}/ in {requested}", args.pattern));
    }
    let mut out = matches.join("\n");
    if truncated {
        out.push_str(&format!("\n[stopped after {max_results} matches]"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorCode;
    use std::os::unix::fs::symlink;

    fn setup() -> (tempfile::TempDir, ToolContext) {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = temp.path().join("ws");
        fs::create_dir_all(ws.join("src")).expect("mkdir");
        fs::write(ws.join("src/main.txt"), "alpha\nTODO fix\nbeta\nTODO test\n").expect("write");
        fs::write(ws.join("notes.txt"), "nothing here\n").expect("write");
        let outside = temp.path().join("outside.txt");
        fs::write(&outside, "TODO secret\n").expect("write");
        symlink(&outside, ws.join("link.txt")).expect("symlink");
        (temp, ToolContext::new(ws))
    }

    fn args(pattern: &str, max_results: Option<usize>) -> GrepArgs {
        GrepArgs {
            pattern: pattern.to_string(),
            path: None,
            max_results,
        }
    }

    #[test]
    fn finds_matches_with_line_numbers_and_skips_symlinks() {
        let (_temp, ctx) = setup();
        let out = grep(&args("TODO", None), &ctx).expect("grep");
        assert_eq!(out, "src/main.txt:2: TODO fix\nsrc/main.txt:4: TODO test");
        assert!(!out.contains("secret"));
    }

    #[test]
    fn caps_results() {
        let (_temp, ctx) = setup();
        let out = grep(&args("TODO", Some(1)), &ctx).expect("grep");
        assert!(out.starts_with("src/main.txt:2: TODO fix\n[stopped after 1 matches]"));
    }

    #[test]
    fn invalid_regex_is_invalid_args() {
        let (_temp, ctx) = setup();
        let err = grep(&args("(", None), &ctx).unwrap_err();
        assert_eq!(err.error_code, Some(ErrorCode::InvalidArgs));
    }

    #[test]
    fn no_matches_is_success() {
        let (_temp, ctx) = setup();
        let out = grep(&args("zzz", None), &ctx).expect("grep");
        assert!(out.starts_with("No matches"));
    }
}
