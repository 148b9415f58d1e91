//! Tracing subscriber installation for binaries and tests embedding the runtime.
//!
//! Filtering follows `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Installs a human-readable subscriber.
///
/// Returns `false` if a global subscriber was already set.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .is_ok()
}

/// Installs a subscriber emitting one JSON object per event.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_json() -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .is_ok()
}
