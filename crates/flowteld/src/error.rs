//! Error types for the flow-telemetry daemon.

use flowtel_collector::CollectorError;
use flowtel_dataplane::DataplaneError;
use flowtel_rulemgr::RuleManagerError;
use thiserror::Error;

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Daemon errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration value out of range.
    #[error("Invalid configuration for {field}: {message}")]
    Config {
        /// The offending field.
        field: String,
        /// Error message.
        message: String,
    },

    /// Configuration file is not valid TOML for the schema.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    RuleManager(#[from] RuleManagerError),

    #[error(transparent)]
    Dataplane(#[from] DataplaneError),
}

impl DaemonError {
    /// Creates a configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = DaemonError::config("server.http_listen", "not a socket address");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for server.http_listen: not a socket address"
        );
    }

    #[test]
    fn test_wraps_rule_manager_error() {
        let err: DaemonError = RuleManagerError::UnknownSwitch("leaf-1".into()).into();
        assert_eq!(err.to_string(), "Unknown switch: leaf-1");
    }
}
