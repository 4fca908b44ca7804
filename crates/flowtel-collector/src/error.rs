//! Error types for the digest consumer.

use flowtel_common::{DigestError, StoreError};
use thiserror::Error;

/// Result type for collector operations.
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Collector errors.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Malformed digest frame.
    #[error("Digest decode failed: {0}")]
    Decode(#[from] DigestError),

    /// Durable store rejected a write.
    #[error("Store operation failed: {operation}: {source}")]
    Store {
        /// The operation that failed.
        operation: String,
        /// The underlying store error.
        #[source]
        source: StoreError,
    },

    /// Invalid collector configuration.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A switch session's ingestion queue is full.
    #[error("Ingestion queue full for switch {switch_id}")]
    SessionBacklog { switch_id: String },

    /// A switch session stopped while a frame was queued.
    #[error("Ingestion session closed for switch {switch_id}")]
    SessionClosed { switch_id: String },

    /// Metrics registry failure.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectorError {
    /// Creates a store error.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    /// Creates an invalid config error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source, .. } => source.is_retryable(),
            Self::Io(_) | Self::SessionBacklog { .. } => true,
            _ => false,
        }
    }
}
