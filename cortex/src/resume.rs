//! Orchestration for re-entering a stored run: human resume, crash
//! continuation and retry with a fresh attempt.

use anyhow::{Context, Result, bail};
use tracing::{info, instrument};

use crate::attempt::{AttemptOutcome, CancelToken, LoopConfig, LoopDeps, begin_attempt, run_attempt};
use crate::core::resume::{ResumeApplied, ResumeInput, apply_resume};
use crate::core::types::{AttemptStatus, RunStatus};
use crate::run::{RecoveryContext, Run};

fn load_run(deps: &LoopDeps<'_>, run_id: &str) -> Result<Run> {
    deps.store
        .get_run(run_id)?
        .with_context(|| format!("run {run_id} not found"))
}

/// Deliver human input to a paused run and re-enter the loop at its cursor.
///
/// Returns `None` when there was nothing to resume: the run is not paused, or
/// `expected_call` names a tool call that is no longer pending. Repeating a
/// resume is therefore harmless.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn resume_run(
    run_id: &str,
    input: &ResumeInput,
    expected_call: Option<&str>,
    deps: &LoopDeps<'_>,
    cfg: &LoopConfig,
    cancel: &CancelToken,
) -> Result<(Run, Option<AttemptOutcome>)> {
    let mut run = load_run(deps, run_id)?;
    if let Some(expected) = expected_call {
        let pending = run
            .current_attempt()
            .and_then(|attempt| attempt.pending_tool_call_id.as_deref());
        if pending != Some(expected) {
            info!(expected, pending = ?pending, "resume targets a call that is not pending");
            return Ok((run, None));
        }
    }

    let redactor = deps.credentials.redactor(cfg.redaction_min_len);
    match apply_resume(&mut run, input, &redactor)? {
        ResumeApplied::NotPaused => {
            info!(status = %run.status, "run is not paused; nothing to resume");
            Ok((run, None))
        }
        ResumeApplied::Resumed => {
            deps.store.update_run(&run)?;
            info!("resuming attempt");
            let outcome = run_attempt(&mut run, deps, cfg, cancel)?;
            Ok((run, Some(outcome)))
        }
    }
}

/// Continue a run whose attempt is still marked running, e.g. after a crash.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn continue_run(
    run_id: &str,
    deps: &LoopDeps<'_>,
    cfg: &LoopConfig,
    cancel: &CancelToken,
) -> Result<(Run, AttemptOutcome)> {
    let mut run = load_run(deps, run_id)?;
    if run.status != RunStatus::Running {
        bail!("run {run_id} is {}, not running", run.status);
    }
    let outcome = run_attempt(&mut run, deps, cfg, cancel)?;
    Ok((run, outcome))
}

/// Start a new attempt of a failed run, carrying the failure as recovery context.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn retry_run(
    run_id: &str,
    guidance: Option<String>,
    deps: &LoopDeps<'_>,
    cfg: &LoopConfig,
    cancel: &CancelToken,
) -> Result<(Run, AttemptOutcome)> {
    let mut run = load_run(deps, run_id)?;
    let previous = run
        .current_attempt()
        .with_context(|| format!("run {run_id} has no attempt to retry"))?;
    if previous.status != AttemptStatus::Failed {
        bail!("run {run_id} is {}; only failed runs can be retried", run.status);
    }
    let failure = previous
        .failure
        .clone()
        .with_context(|| format!("failed attempt of run {run_id} has no failure summary"))?;
    if !failure.retryable {
        bail!(
            "run {run_id} failed with {}, which is not retryable",
            failure.category.as_str()
        );
    }

    let recovery = RecoveryContext::from_failure(previous.index, &failure, guidance);
    begin_attempt(&mut run, deps, cfg, Some(recovery))?;
    deps.store.update_run(&run)?;
    info!(attempt = run.current_attempt_index, "retrying run");
    let outcome = run_attempt(&mut run, deps, cfg, cancel)?;
    Ok((run, outcome))
}
