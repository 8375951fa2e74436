//! Error types for opening transports

use rchiptool_core::transport::TransportError;
use thiserror::Error;

/// Errors raised while opening or configuring a link
#[derive(Debug, Error)]
pub enum SerialError {
    /// Failed to connect to the remote end
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection string could not be parsed
    #[error("Invalid connection string: {0}")]
    InvalidConnection(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for opening transports
pub type Result<T> = core::result::Result<T, SerialError>;

impl From<SerialError> for TransportError {
    fn from(e: SerialError) -> Self {
        match e {
            SerialError::Io(e) => TransportError::Io(e),
            other => TransportError::Serial(other.to_string()),
        }
    }
}
