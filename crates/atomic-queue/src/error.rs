//! Error types for queue operations.

use crate::scripts::Procedure;
use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue engine operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to load script '{procedure}': {message}")]
    ScriptLoad {
        procedure: Procedure,
        message: String,
    },

    #[error("Script '{procedure}' failed: {source}")]
    Execution {
        procedure: Procedure,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed reply from '{procedure}': {message}")]
    MalformedReply {
        procedure: Procedure,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Check if error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::ScriptLoad { .. } => true, // cache stays empty, next call reloads
            Self::Execution { source, .. } => source.is_transient(),
            Self::Store(source) => source.is_transient(),
            Self::MalformedReply { .. } => false,
            Self::Validation(_) => false,
            Self::Serialization(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ScriptLoad { .. } => Some(Duration::seconds(1)),
            Self::Execution { source, .. } | Self::Store(source) => source.retry_after(),
            _ => None,
        }
    }
}

/// Errors reported by an atomic store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("No script registered with identifier {id}")]
    NoScript { id: String },

    #[error("Script rejected by store: {message}")]
    ScriptRejected { message: String },

    #[error("Wrong value type stored at key '{key}'")]
    WrongType { key: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Store error ({store}): {message}")]
    Backend { store: String, message: String },
}

impl StoreError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoScript { .. } => true,
            Self::ScriptRejected { .. } => false,
            Self::WrongType { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::Backend { .. } => true,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionFailed { .. } => Some(Duration::seconds(5)),
            Self::Backend { .. } => Some(Duration::seconds(1)),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Store '{store}' does not satisfy the atomic store contract: {message}")]
    UnsupportedStore { store: String, message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
