//! Error types for store operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tidesync_protocol::{ProtocolError, RecordId, SyncStatus};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// The journal holds a checksum-valid frame that does not decode.
    #[error("journal corrupted: {0}")]
    Corrupted(String),

    /// A failed commit left a partial frame that could not be cut off.
    #[error("journal unusable: a failed write could not be rolled back")]
    Poisoned,

    /// Another process holds the journal.
    #[error("journal locked by another process: {0}")]
    Locked(PathBuf),

    /// The record does not exist.
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    /// The operation is not valid for the record's current status.
    #[error("cannot {operation} record {record_id} in status {status:?}")]
    InvalidTransition {
        /// Record concerned.
        record_id: RecordId,
        /// Its current status.
        status: SyncStatus,
        /// The attempted operation.
        operation: &'static str,
    },
}

impl StoreError {
    /// Creates an invalid-transition error.
    pub fn invalid_transition(record_id: &RecordId, status: SyncStatus, operation: &'static str) -> Self {
        Self::InvalidTransition {
            record_id: record_id.clone(),
            status,
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::invalid_transition(&RecordId::from("x"), SyncStatus::Synced, "retry");
        assert_eq!(err.to_string(), "cannot retry record x in status Synced");

        let err = StoreError::RecordNotFound(RecordId::from("y"));
        assert!(err.to_string().contains('y'));
    }
}
