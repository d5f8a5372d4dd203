//! Development-time tracing for the orchestrator.
//!
//! Tracing is diagnostics only: it goes to stderr and is never persisted. The
//! user-facing record of a run is the status snapshot written by
//! `io/status_store`, whose log messages are unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the level follows the CLI's `-v` count:
/// none is `warn`, one is `info`, two or more is `debug`.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator::io::bridge=debug orchestrator run
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}
