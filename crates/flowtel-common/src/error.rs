//! Error types shared across the flow-telemetry crates.

use thiserror::Error;

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while decoding a digest frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// Frame length does not match the fixed digest layout.
    #[error("Invalid digest length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected frame length.
        expected: usize,
        /// Received frame length.
        actual: usize,
    },

    /// A digest reported zero packets, which no exported record can carry.
    #[error("Digest for flow {flow_id} carries a zero packet count")]
    ZeroPacketCount {
        /// Flow the digest claims to describe.
        flow_id: u32,
    },
}

/// Errors raised while validating a policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// A sampling interval of zero was requested.
    #[error("Invalid sampling interval for {scope}: interval must be at least 1")]
    ZeroSamplingInterval {
        /// "default" or "protocol N".
        scope: String,
    },

    /// A time-based field is out of range.
    #[error("Invalid value for {field}: {message}")]
    InvalidField {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

impl PolicyError {
    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Umbrella error for the common crate.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Digest decode failure.
    #[error(transparent)]
    Digest(#[from] DigestError),

    /// Policy validation failure.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_error_display() {
        let err = DigestError::InvalidLength {
            expected: 35,
            actual: 12,
        };
        assert_eq!(
            err.to_string(),
            "Invalid digest length: expected 35 bytes, got 12"
        );
    }

    #[test]
    fn test_policy_error_display() {
        let err = PolicyError::ZeroSamplingInterval {
            scope: "protocol 6".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid sampling interval for protocol 6: interval must be at least 1"
        );

        let err = PolicyError::invalid_field("flow_timeout_secs", "must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid value for flow_timeout_secs: must be positive"
        );
    }

    #[test]
    fn test_common_error_from() {
        let err: CommonError = DigestError::ZeroPacketCount { flow_id: 7 }.into();
        assert!(matches!(err, CommonError::Digest(_)));
    }
}
