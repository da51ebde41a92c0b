//! # Structured Logging
//!
//! Environment-aware `tracing` setup for the CLI. `RUST_LOG` always wins; otherwise the
//! configured level applies, and without one the level follows `ENVFLOW_ENV`
//! (`debug` for development and test, `info` for production).

use crate::config::{LogFormat, LoggingConfig};
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let directive = config
            .level
            .clone()
            .unwrap_or_else(|| default_level(&environment).to_string());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

        let registry = tracing_subscriber::registry().with(filter);
        let result = match config.format {
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(std::io::stderr().is_terminal())
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };

        if result.is_err() {
            // Someone else (usually a test harness) installed a subscriber first
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::debug!(
            environment = %environment,
            level = %directive,
            format = ?config.format,
            "🔧 Logging initialized"
        );
    });
}

/// Current environment from `ENVFLOW_ENV`, defaulting to development
pub fn get_environment() -> String {
    std::env::var("ENVFLOW_ENV").unwrap_or_else(|_| "development".to_string())
}

fn default_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_by_environment() {
        assert_eq!(default_level("production"), "info");
        assert_eq!(default_level("test"), "debug");
        assert_eq!(default_level("development"), "debug");
        assert_eq!(default_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&LoggingConfig {
            level: Some("trace".to_string()),
            format: LogFormat::Json,
        });
        assert!(LOGGER_INITIALIZED.get().is_some());
    }
}
