//! Error types for the MQTT session manager
//!
//! Every public session operation returns [`SessionResult`]. Errors discovered by the
//! background sync loop are never returned to a caller; they are recorded as the session's
//! last error and drive the reconnection state machine instead.

use crate::transport::mqtt::connection::SessionStatus;
use crate::transport::mqtt::protocol::ProtocolErrorCode;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Missing or invalid connect parameters. Fatal to the call, no state change.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The broker address could not be resolved
    #[error("Failed to resolve {host}:{port}: {reason}")]
    Resolution {
        host: String,
        port: String,
        reason: String,
    },

    /// Every resolved address refused or timed out
    #[error("Failed to open socket to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: String,
        reason: String,
    },

    /// The protocol library reported a non-OK error code
    #[error("{context}: {code}")]
    Protocol {
        code: ProtocolErrorCode,
        context: String,
    },

    /// Operation attempted while the session is not connected
    #[error("Not connected - current state: {status}")]
    NotConnected { status: SessionStatus },

    /// Topic was empty
    #[error("Invalid topic - topic cannot be empty")]
    InvalidTopic,

    /// The operation was interrupted by a disconnect request
    #[error("Session is shutting down")]
    Shutdown,
}

impl SessionError {
    /// Create invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create protocol error with context
    pub fn protocol<S: Into<String>>(code: ProtocolErrorCode, context: S) -> Self {
        Self::Protocol {
            code,
            context: context.into(),
        }
    }

    /// Protocol error code used to classify this failure for reconnection.
    ///
    /// Socket-level failures classify as [`ProtocolErrorCode::SocketError`].
    pub fn protocol_code(&self) -> Option<ProtocolErrorCode> {
        match self {
            SessionError::Protocol { code, .. } => Some(*code),
            SessionError::Resolution { .. } | SessionError::Connect { .. } => {
                Some(ProtocolErrorCode::SocketError)
            }
            _ => None,
        }
    }

    /// Whether the failure is worth an automatic reconnect attempt
    pub fn is_retriable(&self) -> bool {
        match self.protocol_code() {
            Some(code) => crate::transport::mqtt::ErrorClassifier::is_retriable(code),
            None => false,
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            SessionError::invalid_config("host is required"),
            SessionError::Resolution {
                host: "broker.example".to_string(),
                port: "1883".to_string(),
                reason: "no such host".to_string(),
            },
            SessionError::Connect {
                host: "broker.example".to_string(),
                port: "1883".to_string(),
                reason: "connection refused".to_string(),
            },
            SessionError::protocol(ProtocolErrorCode::SocketError, "MQTT sync failed"),
            SessionError::NotConnected {
                status: SessionStatus::Uninitialized,
            },
            SessionError::InvalidTopic,
            SessionError::Shutdown,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_socket_errors_classify_as_socket_error() {
        let err = SessionError::Connect {
            host: "h".to_string(),
            port: "1".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(err.protocol_code(), Some(ProtocolErrorCode::SocketError));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_refused_handshake_is_not_retriable() {
        let err = SessionError::protocol(ProtocolErrorCode::ConnectionRefused, "MQTT connect failed");
        assert!(!err.is_retriable());
        assert!(err.to_string().starts_with("MQTT connect failed"));
    }

    #[test]
    fn test_config_and_state_errors_have_no_code() {
        assert_eq!(SessionError::invalid_config("x").protocol_code(), None);
        assert_eq!(SessionError::InvalidTopic.protocol_code(), None);
        assert!(!SessionError::NotConnected {
            status: SessionStatus::ReconnectFailed
        }
        .is_retriable());
    }
}
