//! Tracing setup for the command-line binary

use tracing_subscriber::{fmt, EnvFilter};

/// Default filter for a given `-v` count. `RUST_LOG` overrides it.
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "sorter=info,warn",
        1 => "sorter=debug,info",
        _ => "sorter=trace,info",
    }
}

/// Install the global fmt subscriber, logging to stderr.
///
/// Calling it again after a subscriber is installed has no effect.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(verbosity).into());

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
