//! Development-time tracing for debugging the runtime.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the runtime's product output.
//!
//! - **Run records and events (`io/state_store`, `io/signals`)**: Product output
//!   under the state directory. Always written, unaffected by `RUST_LOG`.
//!
//! Secret values never reach a tracing field; only credential names and counts do.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=cortex=debug cortex run --task "summarize notes.txt" --tool read_file
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
