//! Tracing initialization for the `move-users` binary.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` takes precedence over `default_level`.
///
/// Levels: error for rollbacks and shutdown failures, info for the steps of the
/// run, debug for transaction management, trace for connections and pools.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},sqlx=warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
