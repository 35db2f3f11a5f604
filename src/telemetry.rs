//! Tracing setup for binaries and tests.

/// Initialize the global tracing subscriber with env-filter support.
///
/// Reads `RUST_LOG` when set, defaulting to `info`. Safe to call from tests:
/// a second initialization is ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
