use crate::types::AskCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Connection errors
    #[error("Serial port not found: {path}")]
    PortNotFound { path: String },

    #[error("Failed to open {path}: {reason}")]
    ConnectionFailed { path: String, reason: String },

    #[error("Device not connected")]
    NotConnected,

    #[error("No response after {attempts} attempt(s) of {timeout_ms} ms")]
    CommunicationTimeout { attempts: u32, timeout_ms: u64 },

    // Protocol errors
    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Hardware rejected command 0x{command:02X}: {ask}")]
    Hardware { command: u8, ask: AskCode },

    // Dispensing errors
    #[error("Slot {slot} out of range (1..={max})")]
    SlotOutOfRange { slot: u8, max: u8 },

    #[error("Device busy with slot {active_slot}")]
    DeviceBusy { active_slot: u8 },

    #[error("Slot {slot} has no patient assigned")]
    SlotNotOccupied { slot: u8 },

    #[error("Slot {slot} is assigned to a different patient")]
    PatientMismatch { slot: u8 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Repository error: {0}")]
    Repository(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, serializable classification of an [`Error`].
///
/// Event consumers match on this instead of parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    PortNotFound,
    ConnectionFailed,
    NotConnected,
    CommunicationTimeout,
    InvalidResponse,
    ChecksumMismatch,
    HardwareError,
    SlotOutOfRange,
    DeviceBusy,
    SlotNotOccupied,
    PatientMismatch,
    InvalidStateTransition,
    RepositoryError,
    ConfigError,
    IoError,
}

impl Error {
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Error::InvalidResponse {
            reason: reason.into(),
        }
    }

    pub fn connection_failed(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::ConnectionFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PortNotFound { .. } => ErrorKind::PortNotFound,
            Error::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::CommunicationTimeout { .. } => ErrorKind::CommunicationTimeout,
            Error::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::Hardware { .. } => ErrorKind::HardwareError,
            Error::SlotOutOfRange { .. } => ErrorKind::SlotOutOfRange,
            Error::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            Error::SlotNotOccupied { .. } => ErrorKind::SlotNotOccupied,
            Error::PatientMismatch { .. } => ErrorKind::PatientMismatch,
            Error::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Error::Repository(_) => ErrorKind::RepositoryError,
            Error::Config(_) => ErrorKind::ConfigError,
            Error::Io(_) => ErrorKind::IoError,
        }
    }

    /// Whether the transport should try the exchange again.
    ///
    /// Only a missing frame or a failed I/O call is retried. A frame that
    /// arrived corrupted or was rejected by the firmware is final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CommunicationTimeout { .. } | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::NotConnected, ErrorKind::NotConnected)]
    #[case(Error::ChecksumMismatch { expected: 1, actual: 2 }, ErrorKind::ChecksumMismatch)]
    #[case(Error::Hardware { command: 0x81, ask: AskCode::Failed }, ErrorKind::HardwareError)]
    #[case(Error::DeviceBusy { active_slot: 3 }, ErrorKind::DeviceBusy)]
    #[case(Error::Config("x".into()), ErrorKind::ConfigError)]
    fn test_error_kind(#[case] error: Error, #[case] expected: ErrorKind) {
        assert_eq!(error.kind(), expected);
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::CommunicationTimeout).unwrap();
        assert_eq!(json, "\"COMMUNICATION_TIMEOUT\"");
        let json = serde_json::to_string(&ErrorKind::HardwareError).unwrap();
        assert_eq!(json, "\"HARDWARE_ERROR\"");
    }

    #[test]
    fn test_retryable() {
        assert!(
            Error::CommunicationTimeout {
                attempts: 1,
                timeout_ms: 10
            }
            .is_retryable()
        );
        assert!(Error::Io(std::io::Error::other("broken pipe")).is_retryable());
        assert!(!Error::ChecksumMismatch { expected: 0, actual: 1 }.is_retryable());
        assert!(!Error::invalid_response("short").is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::ChecksumMismatch {
            expected: 0x85,
            actual: 0x95,
        };
        assert_eq!(err.to_string(), "Checksum mismatch: expected 0x85, got 0x95");

        let err = Error::Hardware {
            command: 0x81,
            ask: AskCode::Failed,
        };
        assert_eq!(
            err.to_string(),
            "Hardware rejected command 0x81: ASK_FAILED (0x11)"
        );

        let err = Error::SlotOutOfRange { slot: 13, max: 12 };
        assert_eq!(err.to_string(), "Slot 13 out of range (1..=12)");
    }
}
