//! Retry pacing for model backend calls.

use std::time::Duration;

/// Default number of tries per model request, first try included.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Delay before retry number `try_number` (1-based): linear in the try count.
pub fn backoff_delay(base: Duration, try_number: u32) -> Duration {
    base.saturating_mul(try_number.max(1))
}

/// Whether another try is allowed after `tries_so_far` tries.
pub fn should_retry(tries_so_far: u32, max_tries: u32) -> bool {
    tries_so_far < max_tries.max(1)
}
