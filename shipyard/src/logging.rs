//! Diagnostic tracing for the shipyard binary.
//!
//! Tracing is for operators debugging a run. Product artifacts (item records,
//! progress logs, the batch checkpoint) are written by the store and never
//! routed through here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Map the `-v` count to a default filter directive.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the level comes from `verbosity`.
/// Output: stderr, compact format.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    // A second init (tests calling main helpers) is harmless; ignore it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
