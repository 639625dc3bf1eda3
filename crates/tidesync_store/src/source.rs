//! The local data source capability.

use crate::error::StoreResult;
use tidesync_protocol::{
    AuthSession, ConflictCase, IdempotencyKey, OperationKind, OutboxEntry, Record, RecordError,
    RecordId, RemoteSnapshot, Resolution, Timestamp, WriteAck,
};

/// What acknowledging a dispatch did to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncedOutcome {
    /// The record is now synced and its entry is gone.
    Synced(Record),
    /// The acknowledged operation was a delete; the record is gone.
    Removed(RecordId),
    /// A newer edit was coalesced while the dispatch was in flight. The
    /// record's version advanced but the newer entry stays queued.
    Superseded(Record),
    /// The entry no longer exists (discarded while in flight).
    Stale,
}

/// What applying a conflict resolution did to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// The remote state was adopted and the record is synced.
    Finalized {
        /// The record as it now stands.
        record: Record,
        /// The local payload that was thrown away.
        discarded_payload: Vec<u8>,
        /// Whether the caller asked to be told about the rollback.
        rollback: bool,
    },
    /// The remote side deleted the record and that was accepted.
    Removed {
        /// Record that was removed.
        record_id: RecordId,
        /// The local payload that was thrown away.
        discarded_payload: Vec<u8>,
        /// Whether the caller asked to be told about the rollback.
        rollback: bool,
    },
    /// The local side was queued again against the remote version.
    Requeued(Record),
    /// The record stays in conflict.
    Deferred(Record),
}

/// The narrow set of store operations the sync engine depends on.
///
/// Every mutating method is one atomic transaction: after a crash either
/// all of its effects are visible on restart or none are.
pub trait LocalDataSource: Send + Sync {
    /// Writes a local edit and creates or coalesces its outbox entry.
    ///
    /// Returns `None` when the edit cancels a create that never left the
    /// device; the record and its entry are both gone.
    fn upsert_optimistic(
        &self,
        id: &RecordId,
        kind: OperationKind,
        payload: Vec<u8>,
        now: Timestamp,
    ) -> StoreResult<Option<Record>>;

    /// Returns a record.
    fn get(&self, id: &RecordId) -> StoreResult<Option<Record>>;

    /// Returns the outbox entry of a record.
    fn entry(&self, id: &RecordId) -> StoreResult<Option<OutboxEntry>>;

    /// Returns up to `limit` entries due at `now`, oldest first.
    fn list_due(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<OutboxEntry>>;

    /// Like [`list_due`](Self::list_due), but skips entries already in
    /// flight and marks the returned ones as in flight.
    ///
    /// Each claimed entry must be released with [`release`](Self::release)
    /// once its outcome is written.
    fn claim_due(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<OutboxEntry>>;

    /// Clears the in-flight mark of a record.
    fn release(&self, id: &RecordId);

    /// Returns when the earliest queued entry not in flight becomes due.
    ///
    /// An entry without a backoff counts as due at [`Timestamp::ZERO`].
    fn next_due_at(&self) -> StoreResult<Option<Timestamp>>;

    /// Records a server acknowledgment of the dispatch made with `key`.
    fn mark_synced(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        ack: WriteAck,
    ) -> StoreResult<SyncedOutcome>;

    /// Parks an entry until `next_retry_at` without counting an attempt.
    /// Used when the request never reached a verdict, such as a failed
    /// session refresh.
    ///
    /// Returns false if the entry changed since dispatch (nothing written).
    fn postpone(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        next_retry_at: Timestamp,
        error: RecordError,
    ) -> StoreResult<bool>;

    /// Parks an entry until `next_retry_at` after a retryable failure.
    ///
    /// Returns false if the entry changed since dispatch (nothing written).
    fn schedule_retry(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        next_retry_at: Timestamp,
        error: RecordError,
    ) -> StoreResult<bool>;

    /// Moves a record into conflict, storing the remote side.
    ///
    /// Returns `None` if the entry dispatched with `key` is gone or was
    /// replaced while in flight.
    fn mark_conflict(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        remote: RemoteSnapshot,
    ) -> StoreResult<Option<ConflictCase>>;

    /// Rebuilds the conflict case of a record parked in conflict.
    fn conflict_case(&self, id: &RecordId) -> StoreResult<Option<ConflictCase>>;

    /// Applies the outcome of conflict resolution.
    fn apply_resolution(
        &self,
        id: &RecordId,
        resolution: &Resolution,
        now: Timestamp,
    ) -> StoreResult<ResolutionOutcome>;

    /// Drops the entry of a record and marks it failed.
    ///
    /// Returns the failed record, or `None` if the entry changed since
    /// dispatch (nothing written).
    fn mark_failed(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        error: RecordError,
    ) -> StoreResult<Option<Record>>;

    /// Queues a failed record again.
    fn retry_failed(&self, id: &RecordId, now: Timestamp) -> StoreResult<Record>;

    /// Drops a record and any entry it has.
    fn discard(&self, id: &RecordId) -> StoreResult<()>;

    /// Returns all records.
    fn records(&self) -> StoreResult<Vec<Record>>;

    /// Returns all outbox entries, oldest first.
    fn outbox(&self) -> StoreResult<Vec<OutboxEntry>>;

    /// Returns the records currently in conflict.
    fn conflicts(&self) -> StoreResult<Vec<Record>>;

    /// Persists the auth session.
    fn save_session(&self, session: &AuthSession) -> StoreResult<()>;

    /// Loads the persisted auth session.
    fn load_session(&self) -> StoreResult<Option<AuthSession>>;

    /// Removes the persisted auth session.
    fn clear_session(&self) -> StoreResult<()>;
}
