//! Isolated execution environment owned by the run manager.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::io::process::{run_command_with_timeout, sandboxed_command};

/// A process to run for the `code` or `shell` tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What a finished process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Stdout followed by stderr, truncation notices included.
    pub output: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Handle to a container that isolates tool processes.
///
/// When present, the runtime delivers each resolved credential once per
/// attempt and routes process-spawning tools through [`ContainerHandle::exec`].
pub trait ContainerHandle: Send + Sync {
    fn deliver_credential(&self, name: &str, value: &str) -> Result<()>;

    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;
}

/// Run `request` as a local child process with a cleared environment.
pub fn exec_local(request: &ExecRequest) -> Result<ExecOutput> {
    let mut cmd = sandboxed_command(&request.program, &request.workdir);
    cmd.args(&request.args);
    let out = run_command_with_timeout(
        cmd,
        request.stdin.as_deref(),
        request.timeout,
        request.output_limit_bytes,
    )?;
    Ok(ExecOutput {
        exit_code: out.status.code(),
        output: out.combined_text(),
        timed_out: out.timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path, script: &str) -> ExecRequest {
        ExecRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            stdin: None,
            workdir: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 4096,
        }
    }

    #[test]
    fn local_exec_reports_exit_code_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ok = exec_local(&request(temp.path(), "echo out; echo err >&2")).expect("exec");
        assert!(ok.success());
        assert!(ok.output.contains("out"));
        assert!(ok.output.contains("[stderr]\nerr"));

        let failed = exec_local(&request(temp.path(), "exit 4")).expect("exec");
        assert_eq!(failed.exit_code, Some(4));
        assert!(!failed.success());
    }
}
