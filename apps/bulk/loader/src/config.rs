//! Configuration for the bulk loader

use bulk_executor::BatchConfig;
use core_config::{ConfigError, Environment, FromEnv, env_or_default};

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    /// Default tracing directive when `RUST_LOG` is unset
    pub log_directive: String,
    pub batch: BatchConfig,
}

impl Config {
    /// Apply command-line overrides on top of the environment configuration.
    pub fn with_overrides(
        mut self,
        batch_size: Option<usize>,
        max_concurrency: Option<i32>,
    ) -> Self {
        if let Some(size) = batch_size {
            self.batch = self.batch.with_batch_size(size);
        }
        if let Some(concurrency) = max_concurrency {
            self.batch = self.batch.with_max_concurrency(concurrency);
        }
        self
    }
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            environment: Environment::from_env(),
            log_directive: env_or_default("LOG_LEVEL", "info,bulk_executor=info"),
            batch: BatchConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars(
            [
                ("APP_ENV", None::<&str>),
                ("LOG_LEVEL", None),
                ("BULK_BATCH_SIZE", None),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert!(config.environment.is_development());
                assert_eq!(config.batch, BatchConfig::default());
            },
        );
    }

    #[test]
    fn test_cli_overrides_environment() {
        temp_env::with_vars(
            [("BULK_BATCH_SIZE", Some("50")), ("BULK_MAX_CONCURRENCY", Some("2"))],
            || {
                let config = Config::from_env().unwrap().with_overrides(Some(10), None);
                assert_eq!(config.batch.batch_size, 10);
                assert_eq!(config.batch.max_concurrency, 2);
            },
        );
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        temp_env::with_var("BULK_BATCH_SIZE", Some("lots"), || {
            assert!(Config::from_env().is_err());
        });
    }
}
