//! Error types for the flow rule manager.

use crate::session::SessionState;
use flowtel_common::{PolicyError, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Result type for rule manager operations.
pub type Result<T> = std::result::Result<T, RuleManagerError>;

/// Rejected session state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Failure talking to a switch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No response within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The switch answered but refused the request.
    #[error("Switch rejected request: {0}")]
    Rejected(String),

    /// The session was cancelled while the request was outstanding.
    #[error("Operation cancelled")]
    Cancelled,
}

impl ChannelError {
    /// Returns true if the request may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

/// Rule manager errors.
#[derive(Debug, Error)]
pub enum RuleManagerError {
    /// Malformed registration or heartbeat request.
    #[error("Invalid request field {field}: {message}")]
    InvalidRequest { field: String, message: String },

    /// No session is registered under this switch id.
    #[error("Unknown switch: {0}")]
    UnknownSwitch(String),

    /// Session state machine violation.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Rejected policy.
    #[error("Invalid policy: {0}")]
    Policy(#[from] PolicyError),

    /// Switch channel failure.
    #[error("Channel error for switch {switch_id}: {source}")]
    Channel {
        switch_id: String,
        #[source]
        source: ChannelError,
    },

    /// Status store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RuleManagerError {
    /// Creates an invalid request error.
    pub fn invalid_request(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a channel error.
    pub fn channel(switch_id: impl Into<String>, source: ChannelError) -> Self {
        Self::Channel {
            switch_id: switch_id.into(),
            source,
        }
    }

    /// Returns true if the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Channel { source, .. } => source.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
