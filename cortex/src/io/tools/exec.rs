//! `code` and `shell`: process-spawning tools.
//!
//! Both run in the workspace, locally or through the container handle when
//! one is attached.

use tracing::warn;

use super::{ToolContext, ToolOutcome, execution_error};
use crate::core::tool_args::{CodeArgs, CodeLanguage, ShellArgs};
use crate::core::types::{ErrorCode, ToolResult};
use crate::io::container::{ExecOutput, ExecRequest, exec_local};

pub(super) fn run_code(args: &CodeArgs, ctx: &ToolContext) -> ToolOutcome {
    let (program, interpreter_args): (&str, &[&str]) = match args.language {
        CodeLanguage::Python => ("python3", &["-"]),
        CodeLanguage::Javascript => ("node", &["-"]),
        CodeLanguage::Bash => ("bash", &["-s"]),
    };
    let request = ExecRequest {
        program: program.to_string(),
        args: interpreter_args.iter().map(|a| a.to_string()).collect(),
        stdin: Some(args.code.clone().into_bytes()),
        workdir: ctx.workspace.clone(),
        timeout: ctx.limits.timeout,
        output_limit_bytes: ctx.limits.output_limit_bytes,
    };
    run(&request, ctx)
}

pub(super) fn run_shell(args: &ShellArgs, ctx: &ToolContext) -> ToolOutcome {
    let request = ExecRequest {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), args.command.clone()],
        stdin: None,
        workdir: ctx.workspace.clone(),
        timeout: ctx.limits.timeout,
        output_limit_bytes: ctx.limits.output_limit_bytes,
    };
    run(&request, ctx)
}

fn run(request: &ExecRequest, ctx: &ToolContext) -> ToolOutcome {
    let output = match &ctx.container {
        Some(container) => container.exec(request),
        None => exec_local(request),
    }
    .map_err(|err| {
        warn!(program = %request.program, err = %err, "failed to start tool process");
        ToolResult::error(
            ErrorCode::ToolNotAvailable,
            format!("could not start {}: {err:#}", request.program),
            false,
        )
    })?;
    into_outcome(output, ctx)
}

fn into_outcome(output: ExecOutput, ctx: &ToolContext) -> ToolOutcome {
    if output.timed_out {
        return Err(execution_error(
            format!(
                "timed out after {}s\n{}",
                ctx.limits.timeout.as_secs(),
                output.output
            ),
            true,
        ));
    }
    match output.exit_code {
        Some(0) => Ok(output.output),
        Some(code) => Err(execution_error(
            format!("exit code {code}\n{}", output.output),
            false,
        )),
        None => Err(execution_error(
            format!("terminated by signal\n{}", output.output),
            false,
        )),
    }
}
