//! Tracing setup for the loopsmith binary.
//!
//! Progress of the feedback loop is reported through `tracing` events on
//! stderr, so stdout stays free for the final answer.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` (e.g. `info`) when
/// unset or unparsable. Calling twice is a no-op.
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
