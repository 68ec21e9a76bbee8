//! Error types for querylens
//!
//! Failures of the wrapped statement execution are never represented here:
//! the collector hands those back to the caller untouched. This type only
//! covers the crate's own fallible surfaces (configuration, serialization).

use thiserror::Error;

/// Result type alias for querylens operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for querylens
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value was rejected by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration {key}={value}: {reason}")]
    InvalidConfig {
        key: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config(key: &'static str, value: impl ToString, reason: &'static str) -> Self {
        Self::InvalidConfig {
            key,
            value: value.to_string(),
            reason,
        }
    }

    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}
