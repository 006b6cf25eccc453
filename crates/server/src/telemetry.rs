//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber. `RUST_LOG` wins when set; otherwise
/// the configured `LOG_LEVEL` applies to the whole tree.
pub fn init(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
