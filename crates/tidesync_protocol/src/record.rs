//! Records under sync control.

use crate::conflict::RemoteSnapshot;
use crate::outbox::OperationKind;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a record.
///
/// Client-assigned identifiers are random UUIDs; server-assigned
/// identifiers are accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh client-side identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Synchronization status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Local state matches the last server acknowledgment.
    Synced,
    /// Created locally, not yet acknowledged.
    PendingCreate,
    /// Updated locally, not yet acknowledged.
    PendingUpdate,
    /// Deleted locally, not yet acknowledged.
    PendingDelete,
    /// Local and remote versions diverged; awaiting resolution.
    Conflict,
    /// Terminal failure; the record carries its last error and payload.
    Failed,
}

impl SyncStatus {
    /// Returns the pending status matching an operation kind.
    pub fn pending_for(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Create => SyncStatus::PendingCreate,
            OperationKind::Update => SyncStatus::PendingUpdate,
            OperationKind::Delete => SyncStatus::PendingDelete,
        }
    }

    /// Returns true if the record has an outbox entry in flight or queued.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncStatus::PendingCreate | SyncStatus::PendingUpdate | SyncStatus::PendingDelete
        )
    }

    /// Returns true if no further automatic progress will be made.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SyncStatus::Synced | SyncStatus::Conflict | SyncStatus::Failed
        )
    }
}

/// Category of the last error recorded on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No route to the server.
    NetworkUnavailable,
    /// 5xx or timeout.
    ServerTransient,
    /// Non-retryable 4xx.
    Rejected,
    /// Local encode/decode failure.
    Serialization,
    /// The retry ceiling was reached.
    AttemptsExhausted,
    /// No usable session.
    Unauthenticated,
    /// The local store failed.
    Storage,
}

/// The last error observed for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    /// Error category.
    pub kind: ErrorKind,
    /// HTTP status, when the server answered.
    pub status: Option<u16>,
    /// Human-readable message.
    pub message: String,
    /// Operation that failed, when the error ended an outbox entry.
    #[serde(default)]
    pub operation: Option<OperationKind>,
}

impl RecordError {
    /// Creates a new record error.
    pub fn new(kind: ErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            operation: None,
        }
    }

    /// Tags the error with the operation it ended.
    pub fn with_operation(mut self, kind: OperationKind) -> Self {
        self.operation = Some(kind);
        self
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} ({}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// A business entity under sync control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier.
    pub id: RecordId,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Last server-acknowledged version (0 = never acknowledged).
    pub version: u64,
    /// Time of the last local edit, or the remote time when remote state was adopted.
    pub updated_at: Timestamp,
    /// Synchronization status.
    pub sync_status: SyncStatus,
    /// Failed dispatches of the current outbox entry.
    pub attempt_count: u32,
    /// Last error observed.
    pub last_error: Option<RecordError>,
    /// Remote state captured when a conflict was detected.
    pub remote_snapshot: Option<RemoteSnapshot>,
}

impl Record {
    /// Creates a record awaiting its first acknowledgment.
    pub fn pending(id: RecordId, kind: OperationKind, payload: Vec<u8>, now: Timestamp) -> Self {
        Self {
            id,
            payload,
            version: 0,
            updated_at: now,
            sync_status: SyncStatus::pending_for(kind),
            attempt_count: 0,
            last_error: None,
            remote_snapshot: None,
        }
    }

    /// Returns true if the server has acknowledged this record at least once.
    pub fn is_known_remotely(&self) -> bool {
        self.version > 0
    }
}
