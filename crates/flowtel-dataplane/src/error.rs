//! Error types for the data plane.

use flowtel_common::PolicyError;
use thiserror::Error;

/// Result type alias for data-plane operations.
pub type Result<T> = std::result::Result<T, DataplaneError>;

/// Data-plane construction and configuration errors.
///
/// The per-packet path itself never fails; these are raised when tables,
/// sinks or policies are built.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// Flow table capacity must be non-zero.
    #[error("Invalid flow table capacity: {0}")]
    InvalidCapacity(u32),

    /// Chained table bucket depth must be non-zero.
    #[error("Invalid bucket depth: {0}")]
    InvalidBucketDepth(usize),

    /// Rejected sampling policy.
    #[error("Policy rejected: {0}")]
    Policy(#[from] PolicyError),

    /// Socket setup failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-blocking send failures reported by a digest sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The transport has no room for the digest right now.
    #[error("Sink full")]
    Full,

    /// The receiving side is gone.
    #[error("Sink closed")]
    Closed,

    /// Transport error.
    #[error("Sink transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataplaneError::InvalidCapacity(0);
        assert_eq!(err.to_string(), "Invalid flow table capacity: 0");

        let err = SinkError::Transport("network unreachable".to_string());
        assert_eq!(err.to_string(), "Sink transport error: network unreachable");
    }
}
