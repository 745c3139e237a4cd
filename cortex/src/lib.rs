//! Motor cortex: the execution runtime behind delegated agent tasks.
//!
//! A caller hands over a task together with a fixed grant of tools and network
//! domains. The runtime drives a tool-using language model through a bounded,
//! resumable loop inside a sandboxed workspace and reports back a result, a
//! pause for human input or approval, or a categorized failure. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (tool argument schemas, credential
//!   resolution and redaction, failure tracking and classification, resume
//!   transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (sandbox, tools, model backend,
//!   state store, signals, artifacts, configuration).
//!
//! Orchestration modules ([`attempt`], [`resume`]) coordinate core logic with
//! I/O to implement CLI commands.

pub mod attempt;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod resume;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
