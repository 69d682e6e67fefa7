//! Error taxonomy shared by the control plane and the IPC layer.
//!
//! Every fallible core operation returns [`CoreError`]. Each variant carries a
//! stable string code that is sent verbatim in ERROR frames and HTTP bodies;
//! transports map the codes to their own status schemes. Anything that doesn't
//! fit the taxonomy is coerced to `Internal` with a correlation id so the log
//! line and the client-visible error can be matched up.

use tracing::error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by sessions, the registry, and the IPC protocol.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// No session with the given id.
    SessionNotFound(String),
    /// Frame type byte not in the protocol table.
    InvalidMessageType(u8),
    /// Framing violation (oversized length, truncated header).
    MalformedFrame(String),
    /// Input payload exceeds the configured frame limit.
    PayloadTooLarge { size: usize, max: usize },
    /// Operation not valid for this session or payload.
    InvalidOperation(String),
    /// Write-type operation on a session that has exited.
    SessionExited,
    /// Session was recovered from a previous server run; its PTY cannot be
    /// re-attached, so input and resize are unavailable.
    NotReattachable,
    /// Per-session IPC connection limit reached.
    ConnectionLimit { limit: usize },
    /// Subscriber queue saturated past the grace period.
    Backpressure,
    /// `<controlDir>/ipc.sock` would exceed the socket address capacity.
    PathTooLong { len: usize, max: usize },
    /// A frame was well-formed but its payload could not be processed.
    MessageProcessing(String),
    /// A CONTROL_CMD was understood but failed to apply.
    ControlMessageFailed(String),
    /// `reset-size` could not re-apply the creation-time size.
    ResetSizeFailed(String),
    /// The child survived SIGKILL past the overall kill deadline.
    KillTimeout,
    /// Catch-all; the correlation id also appears in the server log.
    Internal { correlation: String, message: String },
}

impl CoreError {
    /// Wrap an arbitrary error as `Internal`, logging it with a correlation id.
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        let correlation = uuid::Uuid::new_v4().to_string();
        error!("[{correlation}] {context}: {err}");
        Self::Internal {
            correlation,
            message: context.to_string(),
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidMessageType(_) => "INVALID_MESSAGE_TYPE",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::SessionExited => "SESSION_EXITED",
            Self::NotReattachable => "NOT_REATTACHABLE",
            Self::ConnectionLimit { .. } => "CONNECTION_LIMIT",
            Self::Backpressure => "BACKPRESSURE",
            Self::PathTooLong { .. } => "PATH_TOO_LONG",
            Self::MessageProcessing(_) => "MESSAGE_PROCESSING_ERROR",
            Self::ControlMessageFailed(_) => "CONTROL_MESSAGE_FAILED",
            Self::ResetSizeFailed(_) => "RESET_SIZE_FAILED",
            Self::KillTimeout => "KILL_TIMEOUT",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Whether the IPC connection should be closed after reporting this error.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::ConnectionLimit { .. } | Self::Backpressure
        )
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "Session {id} not found"),
            Self::InvalidMessageType(t) => write!(f, "Unknown message type 0x{t:02x}"),
            Self::MalformedFrame(detail) => write!(f, "Malformed frame: {detail}"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "Payload of {size} bytes exceeds limit of {max}")
            }
            Self::InvalidOperation(detail) => write!(f, "Invalid operation: {detail}"),
            Self::SessionExited => write!(f, "Session has exited"),
            Self::NotReattachable => {
                write!(f, "Session was recovered without a PTY and is read-only")
            }
            Self::ConnectionLimit { limit } => {
                write!(f, "Connection limit of {limit} reached for this session")
            }
            Self::Backpressure => write!(f, "Subscriber evicted: queue saturated past grace period"),
            Self::PathTooLong { len, max } => {
                write!(f, "Socket path of {len} bytes exceeds platform limit of {max}")
            }
            Self::MessageProcessing(detail) => write!(f, "Failed to process message: {detail}"),
            Self::ControlMessageFailed(detail) => write!(f, "Control command failed: {detail}"),
            Self::ResetSizeFailed(detail) => write!(f, "reset-size failed: {detail}"),
            Self::KillTimeout => write!(f, "Child did not exit within the kill deadline"),
            Self::Internal {
                correlation,
                message,
            } => write!(f, "Internal error [{correlation}]: {message}"),
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CoreError::SessionExited.code(), "SESSION_EXITED");
        assert_eq!(CoreError::NotReattachable.code(), "NOT_REATTACHABLE");
        assert_eq!(
            CoreError::PayloadTooLarge { size: 10, max: 5 }.code(),
            "PAYLOAD_TOO_LARGE"
        );
        assert_eq!(
            CoreError::PathTooLong { len: 200, max: 104 }.code(),
            "PATH_TOO_LONG"
        );
        assert_eq!(CoreError::KillTimeout.code(), "KILL_TIMEOUT");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::MalformedFrame("short".into()).is_fatal_for_connection());
        assert!(CoreError::ConnectionLimit { limit: 64 }.is_fatal_for_connection());
        assert!(!CoreError::SessionExited.is_fatal_for_connection());
        assert!(!CoreError::InvalidMessageType(0x7f).is_fatal_for_connection());
    }
}
