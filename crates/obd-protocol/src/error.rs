//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObdError {
    /// No connector has been installed on the session
    #[error("Cannot get connection: no connector was installed on the session")]
    NotConfigured,

    /// Serial port or stream error
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// The connection task has stopped (stream closed or session torn down)
    #[error("OBD connection closed")]
    ConnectionClosed,

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// A poll was requested while the previous one is still in flight
    #[error("{0} cannot poll() while a request is in flight")]
    Busy(String),

    /// PID code not present in the registry
    #[error("No decoder registered for PID {0}")]
    UnknownPid(String),

    /// PID code registered twice
    #[error("PID {0} is already registered")]
    DuplicatePid(String),

    /// A single response line could not be decoded
    #[error("Failed to decode \"{line}\": {reason}")]
    Decode { line: String, reason: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ObdError {
    /// Whether the error means the connection is no longer usable
    pub fn is_transport(&self) -> bool {
        matches!(self, ObdError::SerialError(_) | ObdError::ConnectionClosed)
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

impl From<config::ConfigError> for ObdError {
    fn from(err: config::ConfigError) -> Self {
        ObdError::Config(err.to_string())
    }
}
