//! # Engine Configuration
//!
//! Layered configuration for the execution engine, loaded through the `config` crate.
//!
//! ## Sources (later overrides earlier)
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. An optional `envflow.toml` / `envflow.yaml` / `envflow.json` in the working
//!    directory, or an explicit file passed on the command line
//! 3. `ENVFLOW__SECTION__KEY` environment variables, e.g. `ENVFLOW__RETRY__PULL__ATTEMPTS=5`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use envflow::config::EngineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load(None)?;
//! println!("pull attempts: {}", config.retry.pull.attempts);
//! # Ok(())
//! # }
//! ```

pub mod loader;

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub use loader::{LoadedWorkflow, PredicateRegistry, WorkflowLoader};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "ENVFLOW";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backoff settings for container operations
    pub retry: RetryConfig,

    /// Container runtime settings
    pub container: ContainerConfig,

    /// Logging output settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub pull: RetrySettings,
    pub start: RetrySettings,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            pull: RetrySettings {
                attempts: 3,
                initial_delay_ms: 1000,
                max_delay_ms: 10_000,
                backoff_factor: 2.0,
            },
            start: RetrySettings {
                attempts: 3,
                initial_delay_ms: 500,
                max_delay_ms: 5000,
                backoff_factor: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetrySettings {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl RetrySettings {
    fn validate(&self, name: &str) -> EngineResult<()> {
        if self.attempts == 0 {
            return Err(EngineError::configuration(format!(
                "retry.{name}.attempts must be at least 1"
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(EngineError::configuration(format!(
                "retry.{name}.backoff_factor must be a finite number >= 1.0"
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(EngineError::configuration(format!(
                "retry.{name}.initial_delay_ms exceeds max_delay_ms"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI executable
    pub binary: String,
    /// Label key marking containers this engine created
    pub managed_label: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            managed_label: "envflow.managed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` wins when set. Defaults by environment.
    pub level: Option<String>,
    pub format: LogFormat,
}

impl EngineConfig {
    /// Load defaults, then the optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let defaults = config::Config::try_from(&EngineConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        builder = match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading engine configuration file");
                builder.add_source(config::File::from(path).required(true))
            }
            None => builder.add_source(config::File::with_name("envflow").required(false)),
        };

        let config: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.retry.pull.validate("pull")?;
        self.retry.start.validate("start")?;
        if self.container.binary.trim().is_empty() {
            return Err(EngineError::configuration("container.binary must not be empty"));
        }
        if self.container.managed_label.trim().is_empty() {
            return Err(EngineError::configuration(
                "container.managed_label must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.pull.attempts, 3);
        assert_eq!(config.container.binary, "docker");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[retry.pull]\nattempts = 5\ninitial_delay_ms = 10\nmax_delay_ms = 100\nbackoff_factor = 3.0\n\n[logging]\nformat = \"json\""
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.retry.pull.attempts, 5);
        assert_eq!(config.retry.pull.backoff_factor, 3.0);
        // Untouched sections keep their defaults
        assert_eq!(config.retry.start.attempts, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.retry.start.attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.start.attempts"));
    }

    #[test]
    fn test_validation_rejects_shrinking_backoff() {
        let mut config = EngineConfig::default();
        config.retry.pull.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }
}
