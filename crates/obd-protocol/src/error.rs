//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// The serial port could not be opened
    #[error("Failed to connect to {port}: {reason}")]
    ConnectionFailure { port: String, reason: String },

    /// No link is open
    #[error("Not connected to device")]
    NotConnected,

    /// Timeout waiting for the prompt
    #[error("Timeout waiting for response to '{command}' after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// I/O failure on the serial link; the link has been closed
    #[error("Communication error on {port}: {reason}")]
    TransportFailure { port: String, reason: String },

    /// Adapter answered but is in an unexpected state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Protocol not supported
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// CAN frame violates id width or data length
    #[error("Invalid CAN frame: {0}")]
    InvalidFrame(String),

    /// Argument rejected before anything was sent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller signalled cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Custom PID definition could not be used
    #[error("Custom PID error: {0}")]
    CustomPid(String),

    /// File access error (custom PID store)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed custom PID JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ObdError {
    /// Whether the caller may simply retry or skip the single query
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ObdError::Timeout { .. } | ObdError::InvalidResponse(_))
    }
}

/// Result alias used throughout the crate
pub type ObdResult<T> = Result<T, ObdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ObdError::Timeout {
            command: "010C".into(),
            timeout_ms: 3000
        }
        .is_recoverable());
        assert!(ObdError::InvalidResponse("NO DATA".into()).is_recoverable());
        assert!(!ObdError::NotConnected.is_recoverable());
        assert!(!ObdError::Protocol("bad reset".into()).is_recoverable());
    }

    #[test]
    fn test_timeout_message_names_command() {
        let err = ObdError::Timeout {
            command: "ATZ".into(),
            timeout_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "Timeout waiting for response to 'ATZ' after 1500ms"
        );
    }
}
