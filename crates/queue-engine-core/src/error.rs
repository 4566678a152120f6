//! Error types for the queue engine.
//!
//! Ordinary absence (unknown ids, empty queues) is never an error: those
//! operations return `bool` or `Option`. The types here cover the adapter
//! boundaries only: storage backends, snapshot encoding and configuration.

use thiserror::Error;

/// Errors raised by a [`StorageBackend`](crate::persistence::StorageBackend)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend '{driver}' is not available in this host")]
    NotAvailable { driver: String },

    #[error("Storage I/O failed for key '{key}': {message}")]
    Io { key: String, message: String },

    #[error("Storage key '{key}' is invalid: {message}")]
    InvalidKey { key: String, message: String },

    #[error("Storage backend error: {message}")]
    Internal { message: String },
}

impl StorageError {
    /// Check if a later attempt against the same backend may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotAvailable { .. } => false,
            Self::Io { .. } => true,
            Self::InvalidKey { .. } => false,
            Self::Internal { .. } => true,
        }
    }
}

/// Errors while encoding or decoding a queue snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot belongs to queue '{found}', expected '{expected}'")]
    QueueMismatch { expected: String, found: String },
}

/// Errors returned by the explicit persistence entry points
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Persistence is not configured for queue '{queue_id}'")]
    NotConfigured { queue_id: String },

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
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
}

/// Validation errors for caller-supplied identifiers
#[derive(Debug, Error, PartialEq, Eq)]
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
