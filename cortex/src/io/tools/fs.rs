//! `read_file`, `write_file` and `list_dir`.

use std::fs;
use std::io::ErrorKind;

use walkdir::WalkDir;

use super::{ToolContext, ToolOutcome, execution_error, invalid, not_found};
use crate::core::tool_args::{ListDirArgs, ReadFileArgs, WriteFileArgs};
use crate::io::sandbox::{ResolvedPath, resolve};

/// Entries beyond this are dropped from listings.
const MAX_LIST_ENTRIES: usize = 2_000;

pub(super) fn read_file(args: &ReadFileArgs, ctx: &ToolContext) -> ToolOutcome {
    let target = resolve(&ctx.allowed_roots, &args.path).map_err(|d| d.to_tool_result())?;
    if target.path.is_dir() {
        return Err(invalid(format!(
            "'{}' is a directory; use list_dir instead",
            args.path
        )));
    }
    let contents = fs::read_to_string(&target.path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => not_found(format!("file '{}' does not exist", args.path)),
        ErrorKind::InvalidData => {
            execution_error(format!("file '{}' is not valid UTF-8 text", args.path), false)
        }
        _ => execution_error(format!("read '{}': {err}", args.path), false),
    })?;

    if args.offset.is_none() && args.limit.is_none() {
        return Ok(contents);
    }
    let skip = args.offset.unwrap_or(1).saturating_sub(1);
    let lines: Vec<&str> = contents
        .lines()
        .skip(skip)
        .take(args.limit.unwrap_or(usize::MAX))
        .collect();
    if lines.is_empty() {
        let total = contents.lines().count();
        return Ok(format!(
            "[no lines at offset {}; file has {total} lines]",
            skip + 1
        ));
    }
    Ok(lines.join("\n"))
}

pub(super) fn write_file(args: &WriteFileArgs, ctx: &ToolContext) -> ToolOutcome {
    let target = resolve(&ctx.write_roots, &args.path).map_err(|d| d.to_tool_result())?;
    if target.path.is_dir() {
        return Err(invalid(format!("'{}' is a directory", args.path)));
    }
    if let Some(parent) = target.path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            execution_error(format!("create parent directories for '{}': {err}", args.path), false)
        })?;
    }
    fs::write(&target.path, &args.content)
        .map_err(|err| execution_error(format!("write '{}': {err}", args.path), false))?;
    Ok(format!(
        "Wrote {} bytes to {}",
        args.content.len(),
        target.display_relative()
    ))
}

pub(super) fn list_dir(args: &ListDirArgs, ctx: &ToolContext) -> ToolOutcome {
    let requested = args.path.as_deref().unwrap_or(".");
    let target = resolve(&ctx.allowed_roots, requested).map_err(|d| d.to_tool_result())?;
    if !target.path.exists() {
        return Err(not_found(format!("directory '{requested}' does not exist")));
    }
    if !target.path.is_dir() {
        return Err(invalid(format!("'{requested}' is not a directory")));
    }

    let mut entries = if args.recursive {
        walk_entries(&target)
    } else {
        direct_entries(&target)
            .map_err(|err| execution_error(format!("list '{requested}': {err}"), false))?
    };
    entries.sort();
    if entries.is_empty() {
        return Ok(format!("[{} is empty]", target.display_relative()));
    }
    let total = entries.len();
    entries.truncate(MAX_LIST_ENTRIES);
    let mut out = entries.join("\n");
    if total > MAX_LIST_ENTRIES {
        out.push_str(&format!("\n[{} more entries omitted]", total - MAX_LIST_ENTRIES));
    }
    Ok(out)
}

fn direct_entries(target: &ResolvedPath) -> std::io::Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(&target.path)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        entries.push(name);
    }
    Ok(entries)
}

fn walk_entries(target: &ResolvedPath) -> Vec<String> {
    WalkDir::new(&target.path)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(&target.path).ok()?;
            let mut name = rel.display().to_string();
            if entry.file_type().is_dir() {
                name.push('/');
            }
            Some(name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorCode;

    fn setup() -> (tempfile::TempDir, ToolContext) {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        fs::create_dir_all(workspace.join("docs")).expect("mkdir");
        fs::write(workspace.join("docs/a.txt"), "one\ntwo\nthree\n").expect("write");
        fs::write(workspace.join("top.txt"), "top").expect("write");
        let skills = temp.path().join("skills");
        fs::create_dir_all(skills.join("pdf")).expect("mkdir");
        fs::write(skills.join("pdf/SKILL.md"), "# pdf").expect("write");
        let ctx = ToolContext::new(workspace).with_read_root(skills);
        (temp, ctx)
    }

    #[test]
    fn reads_whole_file_and_line_windows() {
        let (_temp, ctx) = setup();
        let whole = read_file(
            &ReadFileArgs {
                path: "docs/a.txt".to_string(),
                offset: None,
                limit: None,
            },
            &ctx,
        )
        .expect("read");
        assert_eq!(whole, "one\ntwo\nthree\n");

        let window = read_file(
            &ReadFileArgs {
                path: "docs/a.txt".to_string(),
                offset: Some(2),
                limit: Some(1),
            },
            &ctx,
        )
        .expect("read");
        assert_eq!(window, "two");
    }

    #[test]
    fn reads_from_the_skills_root_but_cannot_write_there() {
        let (_temp, ctx) = setup();
        let skill = read_file(
            &ReadFileArgs {
                path: "pdf/SKILL.md".to_string(),
                offset: None,
                limit: None,
            },
            &ctx,
        )
        .expect("read skill");
        assert_eq!(skill, "# pdf");

        let skills_root = ctx.allowed_roots[1].join("pdf/SKILL.md");
        let err = write_file(
            &WriteFileArgs {
                path: skills_root.display().to_string(),
                content: "overwrite".to_string(),
            },
            &ctx,
        )
        .unwrap_err();
        assert_eq!(err.error_code, Some(ErrorCode::PermissionDenied));
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_temp, ctx) = setup();
        let err = read_file(
            &ReadFileArgs {
                path: "nope.txt".to_string(),
                offset: None,
                limit: None,
            },
            &ctx,
        )
        .unwrap_err();
        assert_eq!(err.error_code, Some(ErrorCode::NotFound));
    }

    #[test]
    fn write_creates_parents() {
        let (_temp, ctx) = setup();
        let out = write_file(
            &WriteFileArgs {
                path: "out/nested/report.md".to_string(),
                content: "hello".to_string(),
            },
            &ctx,
        )
        .expect("write");
        assert_eq!(out, "Wrote 5 bytes to out/nested/report.md");
        let written =
            fs::read_to_string(ctx.workspace.join("out/nested/report.md")).expect("read back");
        assert_eq!(written, "hello");
    }

    #[test]
    fn write_outside_is_denied() {
        let (_temp, ctx) = setup();
        let err = write_file(
            &WriteFileArgs {
                path: "../escape.txt".to_string(),
                content: "x".to_string(),
            },
            &ctx,
        )
        .unwrap_err();
        assert_eq!(err.error_code, Some(ErrorCode::PermissionDenied));
        assert!(!ctx.workspace.parent().expect("parent").join("escape.txt").exists());
    }

    #[test]
    fn lists_directories() {
        let (_temp, ctx) = setup();
        let flat = list_dir(
            &ListDirArgs {
                path: None,
                recursive: false,
            },
            &ctx,
        )
        .expect("list");
        assert_eq!(flat, "docs/\ntop.txt");

        let deep = list_dir(
            &ListDirArgs {
                path: None,
                recursive: true,
            },
            &ctx,
        )
        .expect("list");
        assert_eq!(deep, "docs/\ndocs/a.txt\ntop.txt");
    }
}
