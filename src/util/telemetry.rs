//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "render_farm=info";

/// Initialize tracing/telemetry. Users can install their own subscriber; this
/// helper installs an env-filtered fmt subscriber if none is set, falling back
/// to [`DEFAULT_FILTER`] when `RUST_LOG` is absent or invalid.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
