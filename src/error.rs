//! Error Types
//!
//! Error taxonomy for the protocol layer: wire format failures, protocol
//! violations, serialization errors, timeouts and plain I/O.

use std::time::Duration;
use thiserror::Error;

/// Main protocol error type
#[derive(Error, Debug)]
pub enum Error {
    /// Wire format errors: parse failures, unknown signature, bad frame length
    #[error("Format error: {message}")]
    Format { message: String },

    /// Protocol violations: incompatible versions, handshake failures
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Serialization errors from the qbinary or json codecs
    #[error("Serialize error: {message}")]
    Serialize { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Encryption and key exchange errors
    #[error("Security error: {message}")]
    Security { message: String },

    /// Compression and decompression errors
    #[error("Compression error: {message}")]
    Compression { message: String },

    /// An operation exceeded its deadline
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn serialize(message: impl Into<String>) -> Self {
        Self::Serialize { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security { message: message.into() }
    }

    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression { message: message.into() }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Error category for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Format { .. } => "format",
            Error::Protocol { .. } => "protocol",
            Error::Serialize { .. } => "serialize",
            Error::Configuration { .. } => "configuration",
            Error::Security { .. } => "security",
            Error::Compression { .. } => "compression",
            Error::Timeout { .. } => "timeout",
            Error::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            message: error.to_string(),
            source: error,
        }
    }
}
