//! Tracing subscriber setup for binaries and tests embedding the bridge

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `filter` when
/// `RUST_LOG` is unset (default `info`)
///
/// Returns false when a global subscriber was already installed.
pub fn init_logging(filter: Option<&str>) -> bool {
    let fallback = filter.unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .try_init()
        .is_ok()
}
