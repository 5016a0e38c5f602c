//! Logging setup for binaries and test harnesses

use tracing_subscriber::EnvFilter;

use crate::LogConfig;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` overrides the configured directive. Returns false if a
/// subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default().with_directive("warn");
        init(&config);
        // A second install always fails, whoever installed first
        assert!(!init(&config));
    }
}
