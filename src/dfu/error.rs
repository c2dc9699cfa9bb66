//! DFU error types for the firmware upgrade core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for manifest.json or configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Package container or manifest is malformed.
    #[error("Invalid firmware package: {reason}")]
    InvalidFormat { reason: String },

    /// Image digest does not match the digest declared by the container.
    #[error("Hash mismatch for image {slot}: expected {expected}, got {actual}")]
    HashMismatch {
        slot: u32,
        expected: String,
        actual: String,
    },

    /// Container format version is not understood.
    #[error("Unsupported package format version {version}")]
    UnsupportedVersion { version: u32 },

    /// Upgrade configuration is out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Invalid SLIP escape sequence encountered during decoding.
    #[error("Invalid SLIP escape sequence")]
    InvalidSlipEscape,

    /// SLIP frame is incomplete or too short to hold a frame header.
    #[error("Incomplete SLIP frame")]
    IncompleteSlipFrame,

    /// SLIP frame grew past the decoder limit.
    #[error("SLIP frame of {size} bytes exceeds maximum {max_size}")]
    SlipBufferOverflow { size: usize, max_size: usize },

    /// CRC checksum mismatch in received frame.
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Peer answered with a frame that does not fit the request.
    #[error("Unexpected response: {reason}")]
    UnexpectedResponse { reason: String },

    /// Timeout waiting for an acknowledgement or a reconnect.
    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    /// The link dropped while an operation was outstanding.
    #[error("Link lost during {operation}")]
    LinkLost { operation: String },

    /// The peripheral could not be opened.
    #[error("Link unavailable for '{peripheral}': {reason}")]
    LinkUnavailable { peripheral: String, reason: String },

    /// Peripheral reported a verification or command failure.
    #[error("Device rejected {operation} (rc={rc})")]
    DeviceRejected { operation: String, rc: u8 },

    /// An upgrade is already running for this peripheral.
    #[error("An upgrade session is already active for '{peripheral}'")]
    SessionActive { peripheral: String },

    /// Operation was cancelled by user.
    #[error("Operation cancelled by user")]
    Cancelled,
}

impl DfuError {
    pub(crate) fn timeout(operation: impl Into<String>) -> Self {
        DfuError::Timeout {
            operation: operation.into(),
        }
    }

    pub(crate) fn link_lost(operation: impl Into<String>) -> Self {
        DfuError::LinkLost {
            operation: operation.into(),
        }
    }

    pub(crate) fn invalid_format(reason: impl Into<String>) -> Self {
        DfuError::InvalidFormat {
            reason: reason.into(),
        }
    }

    /// Check if this error is retriable (transient link errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(self, DfuError::Timeout { .. } | DfuError::LinkLost { .. })
    }

    /// Classify the error into the coarse taxonomy reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfuError::InvalidFormat { .. } | DfuError::Zip(_) | DfuError::Json(_) => {
                ErrorKind::InvalidFormat
            }
            DfuError::HashMismatch { .. } => ErrorKind::HashMismatch,
            DfuError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            DfuError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            DfuError::Timeout { .. } => ErrorKind::Timeout,
            DfuError::LinkLost { .. } => ErrorKind::LinkLost,
            DfuError::LinkUnavailable { .. } | DfuError::Serial(_) => ErrorKind::LinkUnavailable,
            DfuError::DeviceRejected { .. } => ErrorKind::DeviceRejected,
            DfuError::SessionActive { .. } => ErrorKind::SessionActive,
            DfuError::Cancelled => ErrorKind::Cancelled,
            DfuError::Io(_)
            | DfuError::InvalidSlipEscape
            | DfuError::IncompleteSlipFrame
            | DfuError::SlipBufferOverflow { .. }
            | DfuError::CrcMismatch { .. }
            | DfuError::UnexpectedResponse { .. } => ErrorKind::Protocol,
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Serial(_) => "DFU-001",
            DfuError::Io(_) => "DFU-002",
            DfuError::Zip(_) => "DFU-003",
            DfuError::Json(_) => "DFU-004",
            DfuError::InvalidSlipEscape => "DFU-010",
            DfuError::IncompleteSlipFrame => "DFU-011",
            DfuError::SlipBufferOverflow { .. } => "DFU-012",
            DfuError::CrcMismatch { .. } => "DFU-020",
            DfuError::Timeout { .. } => "DFU-021",
            DfuError::UnexpectedResponse { .. } => "DFU-022",
            DfuError::DeviceRejected { .. } => "DFU-030",
            DfuError::InvalidFormat { .. } => "DFU-040",
            DfuError::HashMismatch { .. } => "DFU-041",
            DfuError::UnsupportedVersion { .. } => "DFU-042",
            DfuError::LinkUnavailable { .. } => "DFU-050",
            DfuError::LinkLost { .. } => "DFU-051",
            DfuError::SessionActive { .. } => "DFU-060",
            DfuError::InvalidConfiguration { .. } => "DFU-070",
            DfuError::Cancelled => "DFU-099",
        }
    }
}

/// Coarse error taxonomy, stable across library error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidFormat,
    HashMismatch,
    UnsupportedVersion,
    InvalidConfiguration,
    Timeout,
    LinkLost,
    LinkUnavailable,
    DeviceRejected,
    SessionActive,
    Protocol,
    Cancelled,
}

/// Clonable failure description carried by terminal states and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl From<&DfuError> for FailureReason {
    fn from(error: &DfuError) -> Self {
        Self {
            kind: error.kind(),
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.message, self.code)
    }
}
