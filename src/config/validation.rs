//! Configuration validation utilities.

use std::time::Duration;

use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Reject zero durations.
pub(crate) fn require_positive(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ValidationError(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(())
}

pub(crate) fn require_non_empty(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{name} cannot be empty"
        )));
    }
    Ok(())
}

/// Only MongoDB connection strings are accepted.
pub(crate) fn validate_url(url: &str) -> Result<(), ConfigError> {
    require_non_empty("database.url", url)?;
    if !(url.starts_with("mongodb://") || url.starts_with("mongodb+srv://")) {
        return Err(ConfigError::ValidationError(format!(
            "database.url must start with mongodb:// or mongodb+srv://, got '{url}'"
        )));
    }
    Ok(())
}

/// Human-readable duration for messages, e.g. `1s 500ms`.
pub(crate) fn display_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("mongodb://localhost:27017").is_ok());
        assert!(validate_url("mongodb+srv://cluster.example.org").is_ok());
        assert!(validate_url("postgres://localhost").is_err());
        assert!(validate_url("  ").is_err());
    }

    #[test]
    fn test_require_positive() {
        assert!(require_positive("x", Duration::from_millis(1)).is_ok());
        let err = require_positive("retry.initial_backoff", Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("retry.initial_backoff"));
    }

    #[test]
    fn test_display_duration() {
        assert_eq!(display_duration(Duration::from_millis(1500)), "1s 500ms");
    }
}
