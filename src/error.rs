//! Error types for the quota engine.

use thiserror::Error;

/// Main error type for quota operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration that must stop the engine from starting
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// The counter backend could not be reached, timed out or answered garbage
    #[error("Quota store unavailable ({backend}): {reason}")]
    StoreUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// A client key that cannot be counted
    #[error("Invalid client key: {0}")]
    InvalidKey(String),
}

impl QuotaError {
    /// Shorthand for building a `StoreUnavailable` from any displayable cause.
    pub fn unavailable(backend: &'static str, reason: impl std::fmt::Display) -> Self {
        QuotaError::StoreUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Whether this error is a transient backend failure.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, QuotaError::StoreUnavailable { .. })
    }
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::InvalidConfig(err.to_string())
    }
}

/// Result type alias for quota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
