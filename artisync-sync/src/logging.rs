//! Process-wide `tracing` subscriber setup for binaries and tests embedding
//! the engine. The library itself only emits events.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the fmt subscriber (`RUST_LOG`, default `info`). Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// JSON lines instead of the human format, for log shippers.
pub fn init_tracing_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init();
}
