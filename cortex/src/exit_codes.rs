//! Stable exit codes for `cortex` CLI commands.

/// Command succeeded or the run completed.
pub const OK: i32 = 0;
/// Invalid arguments, config or run identity, or an unexpected error.
pub const INVALID: i32 = 1;
/// The run paused for a human answer or approval.
pub const AWAITING: i32 = 2;
/// The run's current attempt failed.
pub const FAILED: i32 = 3;
