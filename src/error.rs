//! Error handling for vesc-link
//!
//! This module defines the error taxonomy used across the crate and a Result
//! alias. Errors fall into three groups:
//!
//! - **Recoverable per frame or per request**: [`LinkError::FrameChecksum`],
//!   [`LinkError::CommandTimeout`]
//! - **Fatal to the connection**: [`LinkError::FrameOverflow`],
//!   [`LinkError::Transport`]; the interface worker tears the link down and
//!   publishes a single status message
//! - **Fatal to a job only**: [`LinkError::FirmwareUpload`]

use crate::protocol::CommPacketId;
use crate::types::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for vesc-link operations
#[derive(Error, Debug)]
pub enum LinkError {
    /// A frame failed its checksum or end marker check
    #[error("Frame checksum mismatch (expected 0x{expected:08X}, got 0x{actual:08X})")]
    FrameChecksum { expected: u32, actual: u32 },

    /// The decode buffer grew past its hard cap
    #[error("Frame buffer overflow: {buffered} bytes buffered, cap is {cap}")]
    FrameOverflow { buffered: usize, cap: usize },

    /// A payload that cannot be framed
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Link specific failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No matching reply arrived before the deadline
    #[error("Command {opcode:?} timed out after {after:?}")]
    CommandTimeout { opcode: CommPacketId, after: Duration },

    /// Firmware upload failure
    #[error("Firmware upload failed: {0}")]
    FirmwareUpload(#[from] FirmwareUploadError),

    /// A request was issued without an active link
    #[error("Not connected")]
    NotConnected,

    /// A connect was attempted while a link is not disconnected
    #[error("Already {0}, disconnect first")]
    AlreadyConnected(ConnectionState),

    /// The firmware only accepts update commands
    #[error("Command {opcode:?} not allowed in limited mode")]
    LimitedMode { opcode: CommPacketId },

    /// The operation was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Every autoconnect candidate failed
    #[error("Autoconnect failed after trying {attempted} candidates")]
    AutoconnectFailed { attempted: usize },

    /// A payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LinkError>,
    },
}

impl LinkError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LinkError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error must tear the active link down
    pub fn is_fatal_to_link(&self) -> bool {
        match self {
            LinkError::FrameOverflow { .. } | LinkError::Transport(_) | LinkError::Io(_) => true,
            LinkError::WithContext { source, .. } => source.is_fatal_to_link(),
            _ => false,
        }
    }
}

/// Errors raised by a physical link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The port exists but cannot be opened for writing
    #[error("Port {0} is not writable")]
    PortNotWritable(String),

    /// The port or address could not be resolved
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Opening the link failed
    #[error("Failed to open {endpoint}: {reason}")]
    Open { endpoint: String, reason: String },

    /// BLE service discovery did not finish in time
    #[error("BLE service discovery timed out after {0:?}")]
    BleDiscoveryTimeout(Duration),

    /// The device does not expose the UART service
    #[error("BLE UART service not found on {0}")]
    BleServiceNotFound(String),

    /// The relay hub refused the login
    #[error("TCP hub rejected login: {0}")]
    HubAuthRejected(String),

    /// The peer closed the link
    #[error("Link closed by peer")]
    Closed,

    /// Read or write failure on an open link
    #[error("I/O failure: {0}")]
    Io(String),

    /// CAN bus failure
    #[error("CAN error: {0}")]
    Can(String),

    /// The payload does not fit the link's length field
    #[error("Payload of {len} bytes exceeds the {max} byte limit of this link")]
    PayloadTooLong { len: usize, max: usize },

    /// The link kind was not compiled in
    #[error("{0} support is not enabled in this build")]
    Unsupported(&'static str),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Failures that abort a firmware upload job
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareUploadError {
    /// The target refused to erase the buffer
    #[error("Buffer erase rejected")]
    EraseRejected,

    /// No erase acknowledgement arrived
    #[error("Buffer erase timed out")]
    EraseTimeout,

    /// The target refused a chunk
    #[error("Write rejected at offset {offset}")]
    WriteRejected { offset: u32 },

    /// A chunk exhausted its retries
    #[error("Write timed out at offset {offset} after {attempts} attempts")]
    WriteTimeout { offset: u32, attempts: u32 },

    /// Read back data differs from the image
    #[error("Verify mismatch at address 0x{address:08X}")]
    VerifyMismatch { address: u32 },

    /// Read back failed
    #[error("Verify read failed at address 0x{address:08X}")]
    VerifyReadFailed { address: u32 },

    /// The image is unusable
    #[error("Invalid image: {0}")]
    InvalidImage(String),
}

/// Result type alias for vesc-link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, TransportError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| LinkError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| LinkError::from(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinkError::Decode("short payload".to_string());
        assert_eq!(err.to_string(), "Decode error: short payload");
    }

    #[test]
    fn test_error_with_context() {
        let err = LinkError::NotConnected;
        let with_ctx = err.with_context("Failed to send GET_VALUES");
        assert!(with_ctx.to_string().contains("Failed to send GET_VALUES"));
        assert!(with_ctx.to_string().contains("Not connected"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(LinkError::FrameOverflow { buffered: 10, cap: 5 }.is_fatal_to_link());
        assert!(LinkError::Transport(TransportError::Closed).is_fatal_to_link());
        assert!(LinkError::Transport(TransportError::Closed)
            .with_context("reader")
            .is_fatal_to_link());
        assert!(!LinkError::FrameChecksum { expected: 1, actual: 2 }.is_fatal_to_link());
        assert!(!LinkError::CommandTimeout {
            opcode: CommPacketId::GetValues,
            after: Duration::from_millis(100),
        }
        .is_fatal_to_link());
    }

    #[test]
    fn test_transport_context() {
        let res: std::result::Result<(), TransportError> =
            Err(TransportError::PortNotWritable("/dev/ttyACM0".to_string()));
        let err = res.context("Serial connect").unwrap_err();
        assert!(err.to_string().contains("/dev/ttyACM0"));
        assert!(err.is_fatal_to_link());
    }
}
