pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Application environment (dev = local, prod = deployed)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Local dev, pretty logs
    Production,  // Deployed, JSON logs
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

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

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an environment variable into `T`, falling back to `default` when unset.
///
/// A value that is set but does not parse is an error rather than a silent default.
pub fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Split a comma separated environment value into trimmed, non-empty parts.
pub fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
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
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("Production"), || {
            assert!(Environment::from_env().is_production());
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("MQ_TEST_VAR", Some("value"), || {
            assert_eq!(env_or_default("MQ_TEST_VAR", "default"), "value");
        });
        temp_env::with_var_unset("MQ_TEST_VAR", || {
            assert_eq!(env_or_default("MQ_TEST_VAR", "default"), "default");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("MQ_MISSING_REQUIRED", || {
            let err = env_required("MQ_MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("MQ_MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parse_or() {
        temp_env::with_var("MQ_RETRIES", Some(" 7 "), || {
            assert_eq!(env_parse_or("MQ_RETRIES", 2u32).unwrap(), 7);
        });
        temp_env::with_var_unset("MQ_RETRIES", || {
            assert_eq!(env_parse_or("MQ_RETRIES", 2u32).unwrap(), 2);
        });
        temp_env::with_var("MQ_RETRIES", Some("many"), || {
            let err = env_parse_or("MQ_RETRIES", 2u32).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "MQ_RETRIES"));
        });
    }

    #[test]
    fn test_env_list() {
        temp_env::with_var("MQ_SERVERS", Some("a:1, b:2,,c:3 "), || {
            assert_eq!(
                env_list("MQ_SERVERS").unwrap(),
                vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()]
            );
        });
        temp_env::with_var_unset("MQ_SERVERS", || {
            assert!(env_list("MQ_SERVERS").is_none());
        });
    }
}
