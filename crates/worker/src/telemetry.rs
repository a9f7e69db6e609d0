// Logging initialisation
//
// Console logging through tracing-subscriber, filtered by RUST_LOG or
// LOG_LEVEL.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogConfig {
    /// Log filter (e.g., "info", "debug", "dripline=debug")
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create configuration from environment variables
    ///
    /// `RUST_LOG` is used verbatim. Otherwise `LOG_LEVEL` applies to the
    /// dripline crates only.
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG").ok().or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| level_filter(&level))
        });
        Self { log_filter }
    }
}

fn level_filter(level: &str) -> String {
    ["dripline_worker", "dripline_durable", "dripline_core"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Falls back to `info` on a bad filter.
pub fn init_logging(config: LogConfig) {
    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_targets_dripline_crates() {
        assert_eq!(
            level_filter("debug"),
            "dripline_worker=debug,dripline_durable=debug,dripline_core=debug"
        );
        assert!(EnvFilter::try_new(level_filter("warn")).is_ok());
    }
}
