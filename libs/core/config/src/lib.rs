//! Shared configuration primitives for the bulk tooling.
//!
//! - [`Environment`]: development vs production, driven by `APP_ENV`
//! - [`FromEnv`]: implemented by every config struct loadable from environment variables
//! - `env_*` helpers for defaulted and typed variables
//! - [`tracing`]: subscriber and color-eyre bootstrap

pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Application environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env_or_default("APP_ENV", "development");

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Load an environment variable, falling back to `default` when unset
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an optional environment variable. Unset yields `Ok(None)`.
pub fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                key: key.to_string(),
                details: format!("'{}': {}", raw, e),
            }),
        Err(_) => Ok(None),
    }
}

/// Parse an environment variable, falling back to `default` when unset
pub fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(env_parse(key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("BULK_TEST_VAR", Some("value"), || {
            assert_eq!(env_or_default("BULK_TEST_VAR", "default"), "value");
        });
        temp_env::with_var_unset("BULK_TEST_VAR", || {
            assert_eq!(env_or_default("BULK_TEST_VAR", "default"), "default");
        });
    }

    #[test]
    fn test_env_parse_typed_values() {
        temp_env::with_var("BULK_NUMBER", Some(" 42 "), || {
            assert_eq!(env_parse::<u32>("BULK_NUMBER").unwrap(), Some(42));
        });
        temp_env::with_var_unset("BULK_NUMBER", || {
            assert_eq!(env_parse::<u32>("BULK_NUMBER").unwrap(), None);
            assert_eq!(env_parse_or("BULK_NUMBER", 7u32).unwrap(), 7);
        });
    }

    #[test]
    fn test_env_parse_invalid_value() {
        temp_env::with_var("BULK_RATIO", Some("lots"), || {
            let err = env_parse::<f64>("BULK_RATIO").unwrap_err();
            match err {
                ConfigError::ParseError { key, details } => {
                    assert_eq!(key, "BULK_RATIO");
                    assert!(details.contains("lots"));
                }
            }
        });
    }
}
