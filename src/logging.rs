//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! host's call. This helper covers binaries and examples that just want
//! env-filtered output.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global fmt subscriber honoring `RUST_LOG`, defaulting to
/// `info` with debug-level engine internals. Safe to call more than once;
/// later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,geofetch=debug"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
