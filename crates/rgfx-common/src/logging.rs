use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted for the log filter.
pub const LOG_ENV: &str = "RGFX_LOG";

/// Initialize structured logging with environment filter.
/// Set RGFX_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Same as [`init_logging`], but with a caller-chosen fallback directive when
/// `RGFX_LOG` is unset. Returns false when a subscriber was already installed;
/// the earlier one stays in place.
pub fn init_logging_with_default(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let directive = filter.to_string();

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .is_ok();
    if installed {
        debug!(filter = %directive, "logging initialized");
    }
    installed
}
