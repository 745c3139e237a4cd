//! `patch`: exact single-occurrence text replacement.

use std::fs;
use std::io::ErrorKind;

use super::{ToolContext, ToolOutcome, execution_error, not_found};
use crate::core::tool_args::PatchArgs;
use crate::core::types::{ErrorCode, ToolResult};
use crate::io::sandbox::resolve;

pub(super) fn patch(args: &PatchArgs, ctx: &ToolContext) -> ToolOutcome {
    let target = resolve(&ctx.write_roots, &args.path).map_err(|d| d.to_tool_result())?;
    let contents = fs::read_to_string(&target.path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => not_found(format!("file '{}' does not exist", args.path)),
        _ => execution_error(format!("read '{}': {err}", args.path), false),
    })?;

    match contents.matches(args.old_text.as_str()).count() {
        0 => Err(not_found(format!(
            "old_text not found in '{}'; read the file and copy the exact text to replace",
            args.path
        ))),
        1 => {
            let updated = contents.replacen(args.old_text.as_str(), &args.new_text, 1);
            fs::write(&target.path, updated)
                .map_err(|err| execution_error(format!("write '{}': {err}", args.path), false))?;
            Ok(format!("Patched {}", target.display_relative()))
        }
        n => Err(ToolResult::error(
            ErrorCode::InvalidArgs,
            format!(
                "old_text matches {n} times in '{}'; \
                 include more surrounding lines so it matches exactly once",
                args.path
            ),
            true,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(contents: &str) -> (tempfile::TempDir, ToolContext) {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("f.txt"), contents).expect("write");
        let ctx = ToolContext::new(temp.path().to_path_buf());
        (temp, ctx)
    }

    fn args(old: &str, new: &str) -> PatchArgs {
        PatchArgs {
            path: "f.txt".to_string(),
            old_text: old.to_string(),
            new_text: new.to_string(),
        }
    }

    #[test]
    fn replaces_single_match() {
        let (temp, ctx) = setup("let x = 1;\nlet y = 2;\n");
        patch(&args("x = 1", "x = 10"), &ctx).expect("patch");
        let updated = fs::read_to_string(temp.path().join("f.txt")).expect("read");
        assert_eq!(updated, "let x = 10;\nlet y = 2;\n");
    }

    #[test]
    fn ambiguous_match_is_retryable_invalid_args() {
        let (temp, ctx) = setup("a\nfoo\nb\nfoo\n");
        let err = patch(&args("foo", "bar"), &ctx).unwrap_err();
        assert!(!err.ok);
        assert_eq!(err.error_code, Some(ErrorCode::InvalidArgs));
        assert!(err.retryable);
        let unchanged = fs::read_to_string(temp.path().join("f.txt")).expect("read");
        assert_eq!(unchanged, "a\nfoo\nb\nfoo\n");
    }

    #[test]
    fn missing_text_is_not_found() {
        let (_temp, ctx) = setup("abc");
        let err = patch(&args("xyz", "q"), &ctx).unwrap_err();
        assert_eq!(err.error_code, Some(ErrorCode::NotFound));
    }
}
