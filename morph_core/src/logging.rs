//! Logging bootstrap.
//!
//! The engine logs through the `tracing` facade. Embedders that have no
//! subscriber of their own can call [`init`] once at startup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "MORPH_LOG";

/// Filter used when `MORPH_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "warn";

/// Install a formatting subscriber filtered by `MORPH_LOG`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
