//! INDI error types
//!
//! Provides structured error types for INDI operations.

use std::time::Duration;

use crate::value::PropertyState;

/// INDI client errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndiError {
    /// Connection to INDI server failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// Connection timeout with context
    #[error("Connection timeout: failed to connect to {host}:{port} after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// Not connected to server
    #[error("Not connected to INDI server")]
    NotConnected,
    /// Send channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    /// Device is not present in the store
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),
    /// Property not found
    #[error("Property '{property}' not found on device '{device}'")]
    PropertyNotFound { device: String, property: String },
    /// Stored property has a different leaf type than requested
    #[error("Property '{device}.{property}' is a {actual} vector, expected {expected}")]
    TypeMismatch {
        device: String,
        property: String,
        expected: &'static str,
        actual: &'static str,
    },
    /// Element missing from a vector
    #[error("Element '{element}' not found in property '{property}'")]
    ElementNotFound { property: String, element: String },
    /// Permission denied (attempted to write to read-only property)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// XML parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    /// BLOB payload is not valid base64
    #[error("BLOB decode error for '{name}': {message}")]
    BlobDecode { name: String, message: String },
    /// Local I/O failure (BLOB files)
    #[error("I/O error: {0}")]
    Io(String),
    /// Property did not reach the awaited condition in time
    #[error("Property response timeout for {device}.{property} after {duration:?} (last state: {})", state_label(.last_state))]
    PropertyTimeout {
        device: String,
        property: String,
        duration: Duration,
        last_state: Option<PropertyState>,
    },
    /// Property entered Alert while being awaited
    #[error("Property {device}.{property} entered Alert state")]
    PropertyAlert { device: String, property: String },
    /// Reconnection failed after max attempts
    #[error("Reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectionFailed { attempts: u32, last_error: String },
}

fn state_label(state: &Option<PropertyState>) -> &'static str {
    state.map(|s| s.as_str()).unwrap_or("unknown")
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> Self {
        err.to_string()
    }
}

impl From<quick_xml::Error> for IndiError {
    fn from(err: quick_xml::Error) -> Self {
        IndiError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for IndiError {
    fn from(err: std::io::Error) -> Self {
        IndiError::Io(err.to_string())
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;
