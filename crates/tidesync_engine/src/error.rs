//! Error types for the sync engine.

use thiserror::Error;
use tidesync_protocol::{ErrorKind, ProtocolError, RecordError, RemoteSnapshot};
use tidesync_store::StoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No route to the server.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// 5xx, 408, 429 or a timeout.
    #[error("server transient failure: {message}")]
    ServerTransient {
        /// HTTP status, if the server answered.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// The access token was refused. Handled inside the auth gate.
    #[error("access token expired")]
    AuthExpired,

    /// The session cannot be refreshed; a new login is required.
    #[error("session expired")]
    SessionExpired,

    /// A session refresh failed transiently. The request it guarded was
    /// never judged by the server.
    #[error("session refresh failed: {0}")]
    RefreshFailed(Box<SyncError>),

    /// The server holds a different version of the record.
    #[error("version conflict (remote version {})", .0.version)]
    VersionConflict(RemoteSnapshot),

    /// The server refused the operation for good.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Server-provided reason.
        message: String,
    },

    /// A body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Durable store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No session is installed.
    #[error("not logged in")]
    NotLoggedIn,

    /// The realtime channel is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a transient server error.
    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::ServerTransient {
            status,
            message: message.into(),
        }
    }

    /// Returns true if the operation should be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_)
                | SyncError::ServerTransient { .. }
                | SyncError::RefreshFailed(_)
        )
    }

    /// Returns true if the error is reported to the caller rather than
    /// absorbed by the engine.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            SyncError::SessionExpired | SyncError::Rejected { .. } | SyncError::Serialization(_)
        )
    }

    /// Converts the error into the form stored on a record.
    pub fn to_record_error(&self) -> RecordError {
        if let SyncError::RefreshFailed(inner) = self {
            return inner.to_record_error();
        }
        let (kind, status) = match self {
            SyncError::NetworkUnavailable(_) | SyncError::NotConnected | SyncError::Cancelled => {
                (ErrorKind::NetworkUnavailable, None)
            }
            SyncError::ServerTransient { status, .. } => (ErrorKind::ServerTransient, *status),
            SyncError::Rejected { status, .. } => (ErrorKind::Rejected, Some(*status)),
            SyncError::VersionConflict(_) => (ErrorKind::Rejected, Some(409)),
            SyncError::AuthExpired => (ErrorKind::Unauthenticated, Some(401)),
            SyncError::SessionExpired | SyncError::NotLoggedIn => (ErrorKind::Unauthenticated, None),
            SyncError::Serialization(_) => (ErrorKind::Serialization, None),
            SyncError::Store(_) => (ErrorKind::Storage, None),
            SyncError::RefreshFailed(_) => (ErrorKind::ServerTransient, None),
        };
        let message = match self {
            SyncError::ServerTransient { message, .. } | SyncError::Rejected { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        };
        RecordError::new(kind, status, message)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_protocol::Timestamp;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::NetworkUnavailable("down".into()).is_retryable());
        assert!(SyncError::transient(Some(503), "busy").is_retryable());
        assert!(!SyncError::AuthExpired.is_retryable());
        assert!(!SyncError::Rejected {
            status: 422,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(SyncError::RefreshFailed(Box::new(SyncError::transient(Some(503), "busy")))
            .is_retryable());
    }

    #[test]
    fn surfaced_errors() {
        assert!(SyncError::SessionExpired.is_surfaced());
        assert!(SyncError::Serialization("eof".into()).is_surfaced());
        assert!(!SyncError::AuthExpired.is_surfaced());
        assert!(!SyncError::transient(None, "timeout").is_surfaced());
        let conflict = SyncError::VersionConflict(RemoteSnapshot {
            payload: None,
            version: 4,
            updated_at: Timestamp::ZERO,
        });
        assert!(!conflict.is_surfaced());
        assert!(conflict.to_string().contains('4'));
    }

    #[test]
    fn record_error_mapping() {
        let err = SyncError::Rejected {
            status: 422,
            message: "name is required".into(),
        }
        .to_record_error();
        assert_eq!(err.kind, ErrorKind::Rejected);
        assert_eq!(err.status, Some(422));
        assert_eq!(err.message, "name is required");

        let err = SyncError::NetworkUnavailable("offline".into()).to_record_error();
        assert_eq!(err.kind, ErrorKind::NetworkUnavailable);
        assert_eq!(err.status, None);

        assert_eq!(
            SyncError::SessionExpired.to_record_error().kind,
            ErrorKind::Unauthenticated
        );
        assert_eq!(
            SyncError::AuthExpired.to_record_error().status,
            Some(401)
        );
        assert_eq!(
            SyncError::NotLoggedIn.to_record_error().kind,
            ErrorKind::Unauthenticated
        );
        let store = SyncError::Store(StoreError::RecordNotFound("x".into()));
        assert_eq!(store.to_record_error().kind, ErrorKind::Storage);
        assert_eq!(
            SyncError::Serialization("eof".into()).to_record_error().kind,
            ErrorKind::Serialization
        );
        let refresh = SyncError::RefreshFailed(Box::new(SyncError::transient(Some(503), "busy")))
            .to_record_error();
        assert_eq!(refresh.kind, ErrorKind::ServerTransient);
        assert_eq!(refresh.status, Some(503));
    }
}
