//! Diagnostic tracing for the orchestrator.
//!
//! Tracing output goes to stderr and is not part of the run record. Durable
//! evidence (executor logs, gate logs, diffs) lives under the run directory
//! and is written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbose` picks the level:
/// 0 → `warn`, 1 → `info`, 2+ → `debug`.
///
/// # Example
/// ```bash
/// RUST_LOG=orx=debug orx run "add a health endpoint"
/// ```
pub fn init(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
