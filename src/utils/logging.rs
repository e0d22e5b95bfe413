//! Logging configuration for the market-data service.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the logging system.
///
/// `COINRISK_LOG` takes precedence over `level` and accepts full
/// `EnvFilter` directives (e.g. `coinrisk=debug,hyper=warn`).
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_env("COINRISK_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        info!(level, "Logging initialized");
    }
}

/// Initialize test logging (for use in tests)
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, error, warn};

    #[test]
    fn test_logging() {
        // Visual test - run with `cargo test -- --nocapture` to see the output
        init_logging("debug");

        error!("This is an error message");
        warn!("This is a warning message");
        info!("This is an info message");
        debug!("This is a debug message");
    }

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test_logging();
        init_logging("info");
        init_logging("warn");
    }
}
