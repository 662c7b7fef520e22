//! Error types for vDMA runtime operations

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for vDMA operations
pub type Result<T> = std::result::Result<T, VdmaError>;

/// Errors that can occur during vDMA operations
#[derive(Debug, Error)]
pub enum VdmaError {
    /// A kernel driver call failed
    #[error("Driver call {operation} failed (errno {errno})")]
    Driver {
        /// Driver operation that failed
        operation: &'static str,
        /// OS error number
        errno: i32,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Device not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No Hailo devices detected on the system
    #[error("No Hailo devices detected")]
    NoDevicesFound,

    /// A hardware resource pool ran out
    #[error("Out of {kind}: requested {requested}, available {available}")]
    ResourceExhausted {
        /// Resource kind, e.g. "vdma channel"
        kind: &'static str,
        /// Amount requested
        requested: usize,
        /// Amount that was available
        available: usize,
    },

    /// A descriptor list cannot hold the requested transfer
    #[error("Out of descriptors: requested {requested}, available {available}")]
    OutOfDescriptors {
        /// Descriptors requested
        requested: usize,
        /// Descriptors available
        available: usize,
    },

    /// A host buffer is too small for the access
    #[error("Insufficient buffer: requested {requested} bytes, available {available}")]
    InsufficientBuffer {
        /// Bytes requested
        requested: usize,
        /// Bytes available
        available: usize,
    },

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// The channel or stream was aborted by the user
    #[error("Aborted by user")]
    AbortedByUser,

    /// The channel is not activated
    #[error("Channel not activated")]
    NotActivated,

    /// Firmware control response failed its integrity digest
    #[error("Firmware control response digest mismatch")]
    DigestMismatch,

    /// Unknown action type in an action list
    #[error("Unknown action type {value} at offset {offset}")]
    UnknownActionType {
        /// Raw action type byte
        value: u8,
        /// Byte offset of the record header
        offset: usize,
    },

    /// A record extends past the end of its buffer
    #[error("Truncated record at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the record needs
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
        /// Byte offset of the record
        offset: usize,
    },

    /// Malformed protocol data
    #[error("Malformed data: {reason}")]
    Malformed {
        /// Reason for failure
        reason: String,
    },

    /// Channel index outside the engine
    #[error("Invalid channel index {channel_index}")]
    InvalidChannelId {
        /// Offending channel index
        channel_index: u8,
    },

    /// Invalid argument
    #[error("Invalid argument: {reason}{}", format_candidates(.candidates))]
    InvalidArgument {
        /// Reason for failure
        reason: String,
        /// Candidate values when a lookup was ambiguous
        candidates: Vec<String>,
    },

    /// Operation not valid in the current state
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Reason for failure
        reason: String,
    },

    /// A keyed lookup found nothing
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Firmware rejected a control request
    #[error("Firmware control {opcode:#x} failed (major {major}, minor {minor})")]
    FirmwareControl {
        /// Control opcode
        opcode: u32,
        /// Major status
        major: u32,
        /// Minor status
        minor: u32,
    },
}

fn format_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        String::new()
    } else {
        format!(" (candidates: {})", candidates.join(", "))
    }
}

impl VdmaError {
    /// Create a driver call error
    pub const fn driver(operation: &'static str, errno: i32) -> Self {
        Self::Driver { operation, errno }
    }

    /// Create a timeout error
    pub fn timeout(duration: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = duration.as_millis() as u64;
        Self::Timeout { duration_ms }
    }

    /// Create a malformed data error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
            candidates: Vec::new(),
        }
    }

    /// Create an invalid argument error listing the ambiguous candidates
    pub fn ambiguous(reason: impl Into<String>, candidates: Vec<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
            candidates,
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Timeouts are non-fatal; the caller may retry
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Cancellation requested through `abort()`
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::AbortedByUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(VdmaError::timeout(Duration::from_millis(5)).is_timeout());
        assert!(VdmaError::AbortedByUser.is_aborted());
        assert!(!VdmaError::DigestMismatch.is_timeout());
        assert!(!VdmaError::NotActivated.is_aborted());
    }

    #[test]
    fn test_candidates_rendered() {
        let err = VdmaError::ambiguous("net", vec!["a/net".into(), "b/net".into()]);
        assert_eq!(
            err.to_string(),
            "Invalid argument: net (candidates: a/net, b/net)"
        );
        assert_eq!(
            VdmaError::invalid_argument("bad").to_string(),
            "Invalid argument: bad"
        );
    }

    #[test]
    fn test_exhaustion_reports_counts() {
        let err = VdmaError::ResourceExhausted {
            kind: "vdma channel",
            requested: 1,
            available: 0,
        };
        assert_eq!(err.to_string(), "Out of vdma channel: requested 1, available 0");
    }
}
