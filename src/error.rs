//! Error types for the relay client.

use thiserror::Error;

use crate::error_codes::{DisconnectCause, ErrorCode};

/// Errors surfaced by the relay client and its async wrappers.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The operation was rejected locally before anything was sent
    /// (invalid arguments, wrong state or wrong server).
    #[error("operation could not be started: {0}")]
    Start(String),

    /// The server answered with a non-zero return code.
    #[error("operation failed with return code {return_code}: {}", message.as_deref().unwrap_or("no details"))]
    Operation {
        /// Raw return code from the server.
        return_code: i16,
        /// Debug message sent along with the response, if any.
        message: Option<String>,
    },

    /// Custom authentication was rejected by the authentication provider.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The connection terminated while the operation was outstanding.
    #[error("disconnected: {0}")]
    Disconnected(DisconnectCause),

    /// The peer failed while driving the connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The deadline elapsed before the operation settled.
    #[error("operation timed out")]
    Timeout,

    /// Arguments failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to serialize or deserialize a value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RealtimeError {
    /// Known [`ErrorCode`] of an [`Operation`](Self::Operation) error.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Operation { return_code, .. } => ErrorCode::from_code(*return_code),
            _ => None,
        }
    }

    /// Raw return code of an [`Operation`](Self::Operation) error.
    pub fn return_code(&self) -> Option<i16> {
        match self {
            Self::Operation { return_code, .. } => Some(*return_code),
            _ => None,
        }
    }
}

/// A specialized [`Result`] type for relay client operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_exposes_code() {
        let err = RealtimeError::Operation {
            return_code: 32758,
            message: None,
        };
        assert_eq!(err.return_code(), Some(32758));
        assert_eq!(err.error_code(), Some(ErrorCode::RoomDoesNotExist));
        assert!(err.to_string().contains("32758"));
    }

    #[test]
    fn non_operation_errors_have_no_code() {
        assert_eq!(RealtimeError::Timeout.return_code(), None);
        assert_eq!(RealtimeError::Cancelled.error_code(), None);
    }

    #[test]
    fn disconnected_display_names_cause() {
        let err = RealtimeError::Disconnected(DisconnectCause::ServerTimeout);
        assert_eq!(err.to_string(), "disconnected: ServerTimeout");
    }
}
