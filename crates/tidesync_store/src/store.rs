//! The durable store.

use crate::backend::JournalBackend;
use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, RecoveryReport};
use crate::source::{LocalDataSource, ResolutionOutcome, SyncedOutcome};
use crate::state::{Mutation, StoreState};
use parking_lot::Mutex;
use std::collections::HashSet;
use tidesync_protocol::{
    AuthSession, Coalesce, ConflictCase, IdempotencyKey, LocalPending, OperationKind, OutboxEntry,
    Record, RecordError, RecordId, RemoteSnapshot, Resolution, SyncStatus, Timestamp, WriteAck,
};

struct Inner {
    journal: Journal,
    state: StoreState,
    /// Records whose entry is currently being dispatched. Not persisted:
    /// after a restart nothing is in flight.
    in_flight: HashSet<RecordId>,
}

impl Inner {
    fn commit(&mut self, mutations: Vec<Mutation>) -> StoreResult<()> {
        let tx = self.journal.commit(mutations)?;
        self.state.apply(&tx);
        Ok(())
    }

    fn record(&self, id: &RecordId) -> StoreResult<Record> {
        self.state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::RecordNotFound(id.clone()))
    }

    /// Returns the entry only if it is still the one dispatched with `key`.
    fn dispatched_entry(&self, id: &RecordId, key: IdempotencyKey) -> Option<OutboxEntry> {
        self.state
            .entries
            .get(id)
            .filter(|entry| entry.idempotency_key == key)
            .cloned()
    }
}

/// Durable store backed by a transaction journal.
///
/// All operations take one lock, so every read-modify-write sequence is
/// serialized. A write returns once its frame is durable; nothing here
/// waits on the network.
pub struct DurableStore {
    inner: Mutex<Inner>,
    recovery: RecoveryReport,
}

impl DurableStore {
    /// Opens a store, replaying the journal.
    pub fn open(backend: Box<dyn JournalBackend>) -> StoreResult<Self> {
        let (journal, transactions, recovery) = Journal::open(backend)?;
        let mut state = StoreState::default();
        for tx in &transactions {
            state.apply(tx);
        }

        tracing::debug!(
            transactions = recovery.transactions,
            records = state.records.len(),
            entries = state.entries.len(),
            "store opened"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                journal,
                state,
                in_flight: HashSet::new(),
            }),
            recovery,
        })
    }

    /// Returns what recovery found when the store was opened.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Rewrites the journal as a single snapshot frame.
    pub fn compact(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let before = inner.journal.size()?;
        let snapshot = inner.state.snapshot();
        inner.journal.rewrite(snapshot)?;
        let after = inner.journal.size()?;
        tracing::info!(before, after, "journal compacted");
        Ok(())
    }

    /// Returns the journal size in bytes.
    pub fn journal_size(&self) -> StoreResult<u64> {
        self.inner.lock().journal.size()
    }

    /// Returns the number of records in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}

impl LocalDataSource for DurableStore {
    fn upsert_optimistic(
        &self,
        id: &RecordId,
        kind: OperationKind,
        payload: Vec<u8>,
        now: Timestamp,
    ) -> StoreResult<Option<Record>> {
        let mut inner = self.inner.lock();

        let Some(mut record) = inner.state.records.get(id).cloned() else {
            if kind != OperationKind::Create {
                return Err(StoreError::RecordNotFound(id.clone()));
            }
            let record = Record::pending(id.clone(), kind, payload.clone(), now);
            let entry = OutboxEntry::new(id.clone(), kind, payload, now, 0);
            inner.commit(vec![
                Mutation::PutRecord(record.clone()),
                Mutation::PutEntry(entry),
            ])?;
            return Ok(Some(record));
        };

        if record.sync_status == SyncStatus::Conflict {
            return Err(StoreError::invalid_transition(id, record.sync_status, "edit"));
        }

        // A delete keeps the last payload visible on the record.
        let payload = if kind == OperationKind::Delete {
            record.payload.clone()
        } else {
            payload
        };

        let entry = match inner.state.entries.get(id).cloned() {
            Some(mut entry) => {
                let dispatched = inner.in_flight.contains(id);
                if entry.coalesce(kind, payload.clone(), dispatched) == Coalesce::Cancelled {
                    inner.commit(vec![
                        Mutation::RemoveEntry(id.clone()),
                        Mutation::RemoveRecord(id.clone()),
                    ])?;
                    return Ok(None);
                }
                entry
            }
            None => {
                let kind = match kind {
                    OperationKind::Create => {
                        return Err(StoreError::invalid_transition(
                            id,
                            record.sync_status,
                            "create",
                        ))
                    }
                    _ if record.is_known_remotely() => kind,
                    OperationKind::Delete => {
                        // Never reached the server; nothing to tell it.
                        inner.commit(vec![Mutation::RemoveRecord(id.clone())])?;
                        return Ok(None);
                    }
                    OperationKind::Update => OperationKind::Create,
                };
                OutboxEntry::new(id.clone(), kind, payload.clone(), now, record.version)
            }
        };

        record.payload = payload;
        record.updated_at = now;
        record.sync_status = SyncStatus::pending_for(entry.operation_kind);
        record.attempt_count = entry.attempt;
        if entry.attempt == 0 {
            record.last_error = None;
        }

        inner.commit(vec![
            Mutation::PutRecord(record.clone()),
            Mutation::PutEntry(entry),
        ])?;
        Ok(Some(record))
    }

    fn get(&self, id: &RecordId) -> StoreResult<Option<Record>> {
        Ok(self.inner.lock().state.records.get(id).cloned())
    }

    fn entry(&self, id: &RecordId) -> StoreResult<Option<OutboxEntry>> {
        Ok(self.inner.lock().state.entries.get(id).cloned())
    }

    fn list_due(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<OutboxEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .due_entries(now)
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    fn claim_due(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<OutboxEntry>> {
        let mut inner = self.inner.lock();
        let claimed: Vec<OutboxEntry> = inner
            .state
            .due_entries(now)
            .into_iter()
            .filter(|entry| !inner.in_flight.contains(&entry.record_id))
            .take(limit)
            .cloned()
            .collect();
        for entry in &claimed {
            inner.in_flight.insert(entry.record_id.clone());
        }
        Ok(claimed)
    }

    fn release(&self, id: &RecordId) {
        self.inner.lock().in_flight.remove(id);
    }

    fn next_due_at(&self) -> StoreResult<Option<Timestamp>> {
        let inner = self.inner.lock();
        Ok(inner
            .state
            .entries
            .values()
            .filter(|entry| !inner.in_flight.contains(&entry.record_id))
            .filter(|entry| {
                inner
                    .state
                    .records
                    .get(&entry.record_id)
                    .map_or(true, |r| r.sync_status.is_pending())
            })
            .map(|entry| entry.next_retry_at.unwrap_or(Timestamp::ZERO))
            .min())
    }

    fn mark_synced(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        ack: WriteAck,
    ) -> StoreResult<SyncedOutcome> {
        let mut inner = self.inner.lock();
        let (Some(mut entry), Some(mut record)) = (
            inner.state.entries.get(id).cloned(),
            inner.state.records.get(id).cloned(),
        ) else {
            return Ok(SyncedOutcome::Stale);
        };

        if entry.idempotency_key != key {
            // The server has what was sent; the newer edit now applies on top.
            record.version = ack.version;
            entry.base_version = ack.version;
            if entry.operation_kind == OperationKind::Create {
                entry.operation_kind = OperationKind::Update;
            }
            record.sync_status = SyncStatus::pending_for(entry.operation_kind);
            inner.commit(vec![
                Mutation::PutRecord(record.clone()),
                Mutation::PutEntry(entry),
            ])?;
            return Ok(SyncedOutcome::Superseded(record));
        }

        if entry.operation_kind == OperationKind::Delete {
            inner.commit(vec![
                Mutation::RemoveEntry(id.clone()),
                Mutation::RemoveRecord(id.clone()),
            ])?;
            return Ok(SyncedOutcome::Removed(id.clone()));
        }

        record.version = ack.version;
        record.updated_at = ack.updated_at;
        record.sync_status = SyncStatus::Synced;
        record.attempt_count = 0;
        record.last_error = None;
        record.remote_snapshot = None;
        inner.commit(vec![
            Mutation::RemoveEntry(id.clone()),
            Mutation::PutRecord(record.clone()),
        ])?;
        Ok(SyncedOutcome::Synced(record))
    }

    fn schedule_retry(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        next_retry_at: Timestamp,
        error: RecordError,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let Some(mut entry) = inner.dispatched_entry(id, key) else {
            return Ok(false);
        };
        let mut record = inner.record(id)?;

        entry.attempt = entry.attempt.saturating_add(1);
        entry.next_retry_at = Some(next_retry_at);
        record.attempt_count = entry.attempt;
        record.last_error = Some(error);

        inner.commit(vec![
            Mutation::PutRecord(record),
            Mutation::PutEntry(entry),
        ])?;
        Ok(true)
    }

    fn postpone(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        next_retry_at: Timestamp,
        error: RecordError,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let Some(mut entry) = inner.dispatched_entry(id, key) else {
            return Ok(false);
        };
        let mut record = inner.record(id)?;

        entry.next_retry_at = Some(next_retry_at);
        record.last_error = Some(error);

        inner.commit(vec![
            Mutation::PutRecord(record),
            Mutation::PutEntry(entry),
        ])?;
        Ok(true)
    }

    fn mark_conflict(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        remote: RemoteSnapshot,
    ) -> StoreResult<Option<ConflictCase>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.dispatched_entry(id, key) else {
            return Ok(None);
        };
        let mut record = inner.record(id)?;

        record.sync_status = SyncStatus::Conflict;
        record.remote_snapshot = Some(remote.clone());
        let case = ConflictCase {
            record_id: id.clone(),
            local: LocalPending {
                operation_kind: entry.operation_kind,
                payload: entry.payload_snapshot,
                updated_at: record.updated_at,
                base_version: entry.base_version,
            },
            remote,
        };

        inner.commit(vec![Mutation::PutRecord(record)])?;
        Ok(Some(case))
    }

    fn conflict_case(&self, id: &RecordId) -> StoreResult<Option<ConflictCase>> {
        let inner = self.inner.lock();
        let Some(record) = inner.state.records.get(id) else {
            return Ok(None);
        };
        let (SyncStatus::Conflict, Some(remote)) = (record.sync_status, &record.remote_snapshot)
        else {
            return Ok(None);
        };

        let local = match inner.state.entries.get(id) {
            Some(entry) => LocalPending {
                operation_kind: entry.operation_kind,
                payload: entry.payload_snapshot.clone(),
                updated_at: record.updated_at,
                base_version: entry.base_version,
            },
            None => LocalPending {
                operation_kind: OperationKind::Update,
                payload: record.payload.clone(),
                updated_at: record.updated_at,
                base_version: record.version,
            },
        };
        Ok(Some(ConflictCase {
            record_id: id.clone(),
            local,
            remote: remote.clone(),
        }))
    }

    fn apply_resolution(
        &self,
        id: &RecordId,
        resolution: &Resolution,
        now: Timestamp,
    ) -> StoreResult<ResolutionOutcome> {
        let mut inner = self.inner.lock();
        let mut record = inner.record(id)?;
        let remote = match (&record.sync_status, &record.remote_snapshot) {
            (SyncStatus::Conflict, Some(remote)) => remote.clone(),
            _ => return Err(StoreError::invalid_transition(id, record.sync_status, "resolve")),
        };
        let entry = inner.state.entries.get(id).cloned();
        let local_kind = entry
            .as_ref()
            .map_or(OperationKind::Update, |e| e.operation_kind);
        let local_payload = entry
            .as_ref()
            .map_or_else(|| record.payload.clone(), |e| e.payload_snapshot.clone());

        match resolution {
            Resolution::Defer => Ok(ResolutionOutcome::Deferred(record)),

            Resolution::AcceptRemote { rollback } => match remote.payload {
                None => {
                    inner.commit(vec![
                        Mutation::RemoveEntry(id.clone()),
                        Mutation::RemoveRecord(id.clone()),
                    ])?;
                    Ok(ResolutionOutcome::Removed {
                        record_id: id.clone(),
                        discarded_payload: local_payload,
                        rollback: *rollback,
                    })
                }
                Some(payload) => {
                    record.payload = payload;
                    record.version = remote.version;
                    record.updated_at = remote.updated_at;
                    record.sync_status = SyncStatus::Synced;
                    record.attempt_count = 0;
                    record.last_error = None;
                    record.remote_snapshot = None;
                    inner.commit(vec![
                        Mutation::RemoveEntry(id.clone()),
                        Mutation::PutRecord(record.clone()),
                    ])?;
                    Ok(ResolutionOutcome::Finalized {
                        record,
                        discarded_payload: local_payload,
                        rollback: *rollback,
                    })
                }
            },

            Resolution::KeepLocal { payload } => {
                let kind = match (local_kind, remote.is_deleted()) {
                    (OperationKind::Delete, true) => {
                        // Both sides deleted it.
                        inner.commit(vec![
                            Mutation::RemoveEntry(id.clone()),
                            Mutation::RemoveRecord(id.clone()),
                        ])?;
                        return Ok(ResolutionOutcome::Removed {
                            record_id: id.clone(),
                            discarded_payload: Vec::new(),
                            rollback: false,
                        });
                    }
                    (_, true) => OperationKind::Create,
                    (OperationKind::Delete, false) => OperationKind::Delete,
                    (_, false) => OperationKind::Update,
                };

                let created_at = entry.as_ref().map_or(now, |e| e.created_at);
                let entry = OutboxEntry::new(
                    id.clone(),
                    kind,
                    payload.clone(),
                    created_at,
                    remote.version,
                );
                if kind != OperationKind::Delete {
                    record.payload = payload.clone();
                }
                record.version = remote.version;
                record.sync_status = SyncStatus::pending_for(kind);
                record.attempt_count = 0;
                record.last_error = None;
                record.remote_snapshot = None;

                inner.commit(vec![
                    Mutation::PutRecord(record.clone()),
                    Mutation::PutEntry(entry),
                ])?;
                Ok(ResolutionOutcome::Requeued(record))
            }
        }
    }

    fn mark_failed(
        &self,
        id: &RecordId,
        key: IdempotencyKey,
        error: RecordError,
    ) -> StoreResult<Option<Record>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.dispatched_entry(id, key) else {
            return Ok(None);
        };
        let mut record = inner.record(id)?;

        record.sync_status = SyncStatus::Failed;
        record.attempt_count = entry.attempt;
        record.last_error = Some(error.with_operation(entry.operation_kind));
        inner.commit(vec![
            Mutation::RemoveEntry(id.clone()),
            Mutation::PutRecord(record.clone()),
        ])?;
        Ok(Some(record))
    }

    fn retry_failed(&self, id: &RecordId, now: Timestamp) -> StoreResult<Record> {
        let mut inner = self.inner.lock();
        let mut record = inner.record(id)?;
        if record.sync_status != SyncStatus::Failed {
            return Err(StoreError::invalid_transition(id, record.sync_status, "retry"));
        }

        let failed_kind = record.last_error.as_ref().and_then(|e| e.operation);
        let kind = match failed_kind {
            Some(OperationKind::Delete) if record.is_known_remotely() => OperationKind::Delete,
            _ if record.is_known_remotely() => OperationKind::Update,
            _ => OperationKind::Create,
        };
        let entry = OutboxEntry::new(id.clone(), kind, record.payload.clone(), now, record.version);

        record.sync_status = SyncStatus::pending_for(kind);
        record.attempt_count = 0;
        record.last_error = None;
        inner.commit(vec![
            Mutation::PutRecord(record.clone()),
            Mutation::PutEntry(entry),
        ])?;
        Ok(record)
    }

    fn discard(&self, id: &RecordId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.state.records.contains_key(id) {
            return Err(StoreError::RecordNotFound(id.clone()));
        }
        inner.commit(vec![
            Mutation::RemoveEntry(id.clone()),
            Mutation::RemoveRecord(id.clone()),
        ])
    }

    fn records(&self) -> StoreResult<Vec<Record>> {
        Ok(self.inner.lock().state.records.values().cloned().collect())
    }

    fn outbox(&self) -> StoreResult<Vec<OutboxEntry>> {
        let inner = self.inner.lock();
        let mut entries: Vec<OutboxEntry> = inner.state.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        Ok(entries)
    }

    fn conflicts(&self) -> StoreResult<Vec<Record>> {
        Ok(self
            .inner
            .lock()
            .state
            .records
            .values()
            .filter(|r| r.sync_status == SyncStatus::Conflict)
            .cloned()
            .collect())
    }

    fn save_session(&self, session: &AuthSession) -> StoreResult<()> {
        self.inner
            .lock()
            .commit(vec![Mutation::PutSession(session.clone())])
    }

    fn load_session(&self) -> StoreResult<Option<AuthSession>> {
        Ok(self.inner.lock().state.session.clone())
    }

    fn clear_session(&self) -> StoreResult<()> {
        self.inner.lock().commit(vec![Mutation::ClearSession])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileJournal;
    use crate::memory::MemoryJournal;
    use proptest::prelude::*;
    use tempfile::tempdir;
    use tidesync_protocol::ErrorKind;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn open(backend: &MemoryJournal) -> DurableStore {
        DurableStore::open(Box::new(backend.clone())).unwrap()
    }

    fn ack(version: u64) -> WriteAck {
        WriteAck {
            version,
            updated_at: ts(1_000),
        }
    }

    fn created(store: &DurableStore, id: &str, at: u64) -> RecordId {
        let id = RecordId::from(id);
        store
            .upsert_optimistic(&id, OperationKind::Create, vec![1], ts(at))
            .unwrap()
            .unwrap();
        id
    }

    fn synced(store: &DurableStore, id: &str) -> RecordId {
        let id = created(store, id, 1);
        let key = store.entry(&id).unwrap().unwrap().idempotency_key;
        store.mark_synced(&id, key, ack(1)).unwrap();
        id
    }

    fn dispatched_key(store: &DurableStore, id: &RecordId) -> IdempotencyKey {
        store.entry(id).unwrap().unwrap().idempotency_key
    }

    fn transient() -> RecordError {
        RecordError::new(ErrorKind::ServerTransient, Some(503), "unavailable")
    }

    #[test]
    fn create_writes_record_and_entry_together() {
        let backend = MemoryJournal::new();
        let store = open(&backend);
        let id = created(&store, "a", 5);

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingCreate);
        let entry = store.entry(&id).unwrap().unwrap();
        assert_eq!(entry.operation_kind, OperationKind::Create);
        assert_eq!(entry.created_at, ts(5));

        let reopened = open(&backend);
        assert_eq!(reopened.get(&id).unwrap(), Some(record));
        assert_eq!(reopened.entry(&id).unwrap(), Some(entry));
    }

    #[test]
    fn edit_of_unknown_record_fails() {
        let store = open(&MemoryJournal::new());
        let err = store
            .upsert_optimistic(&RecordId::from("x"), OperationKind::Update, vec![], ts(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound(_)));
    }

    #[test]
    fn mark_synced_clears_entry() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.version, 1);
        assert!(store.entry(&id).unwrap().is_none());
    }

    #[test]
    fn two_edits_coalesce_into_one_entry() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");

        store
            .upsert_optimistic(&id, OperationKind::Update, vec![2], ts(10))
            .unwrap();
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![3], ts(20))
            .unwrap();

        let outbox = store.outbox().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].payload_snapshot, vec![3]);
        assert_eq!(outbox[0].created_at, ts(10));
        assert_eq!(outbox[0].base_version, 1);
    }

    #[test]
    fn create_then_delete_before_dispatch_cancels() {
        let store = open(&MemoryJournal::new());
        let id = created(&store, "a", 1);

        let result = store
            .upsert_optimistic(&id, OperationKind::Delete, vec![], ts(2))
            .unwrap();
        assert!(result.is_none());
        assert!(store.get(&id).unwrap().is_none());
        assert!(store.outbox().unwrap().is_empty());
    }

    #[test]
    fn create_then_delete_while_in_flight_becomes_delete() {
        let store = open(&MemoryJournal::new());
        let id = created(&store, "a", 1);
        let claimed = store.claim_due(ts(1), 10).unwrap();
        assert_eq!(claimed.len(), 1);

        let record = store
            .upsert_optimistic(&id, OperationKind::Delete, vec![], ts(2))
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingDelete);
        assert_eq!(record.payload, vec![1]);

        // The in-flight create lands; the delete stays queued against it.
        let outcome = store
            .mark_synced(&id, claimed[0].idempotency_key, ack(1))
            .unwrap();
        assert!(matches!(outcome, SyncedOutcome::Superseded(_)));
        let entry = store.entry(&id).unwrap().unwrap();
        assert_eq!(entry.operation_kind, OperationKind::Delete);
        assert_eq!(entry.base_version, 1);
    }

    #[test]
    fn update_during_in_flight_create_becomes_update_after_ack() {
        let store = open(&MemoryJournal::new());
        let id = created(&store, "a", 1);
        let claimed = store.claim_due(ts(1), 10).unwrap();

        store
            .upsert_optimistic(&id, OperationKind::Update, vec![9], ts(2))
            .unwrap();
        store
            .mark_synced(&id, claimed[0].idempotency_key, ack(1))
            .unwrap();
        store.release(&id);

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingUpdate);
        assert_eq!(record.version, 1);
        assert_eq!(record.payload, vec![9]);
        assert_eq!(store.list_due(ts(3), 10).unwrap().len(), 1);
    }

    #[test]
    fn delete_of_never_synced_record_without_entry_removes_locally() {
        let store = open(&MemoryJournal::new());
        let id = created(&store, "a", 1);
        let key = store.entry(&id).unwrap().unwrap().idempotency_key;
        store
            .mark_failed(&id, key, RecordError::new(ErrorKind::Rejected, Some(422), "bad"))
            .unwrap();

        let result = store
            .upsert_optimistic(&id, OperationKind::Delete, vec![], ts(3))
            .unwrap();
        assert!(result.is_none());
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn list_due_is_fifo_and_bounded() {
        let store = open(&MemoryJournal::new());
        created(&store, "c", 30);
        created(&store, "a", 10);
        created(&store, "b", 20);

        let due = store.list_due(ts(100), 2).unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn claim_skips_in_flight() {
        let store = open(&MemoryJournal::new());
        created(&store, "a", 1);
        created(&store, "b", 2);

        assert_eq!(store.claim_due(ts(5), 1).unwrap().len(), 1);
        let second = store.claim_due(ts(5), 10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].record_id.as_str(), "b");
        assert!(store.claim_due(ts(5), 10).unwrap().is_empty());

        store.release(&RecordId::from("a"));
        assert_eq!(store.claim_due(ts(5), 10).unwrap().len(), 1);
    }

    #[test]
    fn schedule_retry_counts_attempts_and_parks() {
        let store = open(&MemoryJournal::new());
        let id = created(&store, "a", 1);
        let key = store.entry(&id).unwrap().unwrap().idempotency_key;

        assert!(store.schedule_retry(&id, key, ts(500), transient()).unwrap());
        let entry = store.entry(&id).unwrap().unwrap();
        assert_eq!(entry.attempt, 1);
        assert_eq!(entry.idempotency_key, key);
        assert!(store.list_due(ts(499), 10).unwrap().is_empty());
        assert_eq!(store.list_due(ts(500), 10).unwrap().len(), 1);
        assert_eq!(store.next_due_at().unwrap(), Some(ts(500)));

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error, Some(transient()));

        let stale = IdempotencyKey::generate();
        assert!(!store.schedule_retry(&id, stale, ts(900), transient()).unwrap());
    }

    #[test]
    fn postpone_parks_without_counting_attempt() {
        let store = open(&MemoryJournal::new());
        let id = created(&store, "a", 1);
        let key = dispatched_key(&store, &id);

        assert!(store.postpone(&id, key, ts(500), transient()).unwrap());
        let entry = store.entry(&id).unwrap().unwrap();
        assert_eq!(entry.attempt, 0);
        assert_eq!(entry.next_retry_at, Some(ts(500)));
        assert!(store.list_due(ts(499), 10).unwrap().is_empty());

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.last_error, Some(transient()));

        assert!(!store
            .postpone(&id, IdempotencyKey::generate(), ts(900), transient())
            .unwrap());
    }

    #[test]
    fn conflict_parks_entry_until_resolved() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![2], ts(10))
            .unwrap();

        let remote = RemoteSnapshot {
            payload: Some(vec![7]),
            version: 4,
            updated_at: ts(50),
        };
        let key = dispatched_key(&store, &id);
        let case = store.mark_conflict(&id, key, remote.clone()).unwrap().unwrap();
        assert_eq!(case.local.payload, vec![2]);
        assert_eq!(case.local.base_version, 1);
        assert_eq!(store.conflict_case(&id).unwrap(), Some(case));
        assert!(store.list_due(ts(100), 10).unwrap().is_empty());
        assert_eq!(store.conflicts().unwrap().len(), 1);

        let err = store
            .upsert_optimistic(&id, OperationKind::Update, vec![3], ts(60))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn conflict_on_stale_dispatch_is_ignored() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![2], ts(10))
            .unwrap();
        let remote = RemoteSnapshot {
            payload: Some(vec![7]),
            version: 4,
            updated_at: ts(50),
        };

        let stale = IdempotencyKey::generate();
        assert_eq!(store.mark_conflict(&id, stale, remote.clone()).unwrap(), None);
        assert_eq!(
            store.get(&id).unwrap().unwrap().sync_status,
            SyncStatus::PendingUpdate
        );

        let key = dispatched_key(&store, &id);
        store.discard(&id).unwrap();
        assert_eq!(store.mark_conflict(&id, key, remote).unwrap(), None);
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn accept_remote_finalizes_with_remote_payload() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![2], ts(10))
            .unwrap();
        store
            .mark_conflict(
                &id,
                dispatched_key(&store, &id),
                RemoteSnapshot {
                    payload: Some(vec![7]),
                    version: 4,
                    updated_at: ts(50),
                },
            )
            .unwrap();

        let outcome = store
            .apply_resolution(&id, &Resolution::AcceptRemote { rollback: true }, ts(60))
            .unwrap();
        let ResolutionOutcome::Finalized {
            record,
            discarded_payload,
            rollback,
        } = outcome
        else {
            panic!("expected finalized, got {:?}", outcome);
        };
        assert_eq!(record.payload, vec![7]);
        assert_eq!(record.version, 4);
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(discarded_payload, vec![2]);
        assert!(rollback);
        assert!(store.entry(&id).unwrap().is_none());
    }

    #[test]
    fn keep_local_requeues_against_remote_version() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![2], ts(10))
            .unwrap();
        let created_at = store.entry(&id).unwrap().unwrap().created_at;
        store
            .mark_conflict(
                &id,
                dispatched_key(&store, &id),
                RemoteSnapshot {
                    payload: Some(vec![7]),
                    version: 4,
                    updated_at: ts(5),
                },
            )
            .unwrap();

        let outcome = store
            .apply_resolution(&id, &Resolution::KeepLocal { payload: vec![2, 7] }, ts(60))
            .unwrap();
        assert!(matches!(outcome, ResolutionOutcome::Requeued(_)));

        let entry = store.entry(&id).unwrap().unwrap();
        assert_eq!(entry.operation_kind, OperationKind::Update);
        assert_eq!(entry.base_version, 4);
        assert_eq!(entry.payload_snapshot, vec![2, 7]);
        assert_eq!(entry.created_at, created_at);
        assert_eq!(store.list_due(ts(60), 10).unwrap().len(), 1);
    }

    #[test]
    fn keep_local_against_remote_delete_recreates() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![2], ts(10))
            .unwrap();
        store
            .mark_conflict(
                &id,
                dispatched_key(&store, &id),
                RemoteSnapshot {
                    payload: None,
                    version: 2,
                    updated_at: ts(5),
                },
            )
            .unwrap();
        store
            .apply_resolution(&id, &Resolution::KeepLocal { payload: vec![2] }, ts(11))
            .unwrap();
        assert_eq!(
            store.entry(&id).unwrap().unwrap().operation_kind,
            OperationKind::Create
        );
    }

    #[test]
    fn deferred_resolution_leaves_conflict() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![2], ts(10))
            .unwrap();
        store
            .mark_conflict(
                &id,
                dispatched_key(&store, &id),
                RemoteSnapshot {
                    payload: Some(vec![3]),
                    version: 2,
                    updated_at: ts(5),
                },
            )
            .unwrap();
        let outcome = store
            .apply_resolution(&id, &Resolution::Defer, ts(11))
            .unwrap();
        assert!(matches!(outcome, ResolutionOutcome::Deferred(_)));
        assert_eq!(
            store.get(&id).unwrap().unwrap().sync_status,
            SyncStatus::Conflict
        );
    }

    #[test]
    fn failed_record_keeps_payload_and_can_be_retried() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Update, vec![5], ts(10))
            .unwrap();
        let key = store.entry(&id).unwrap().unwrap().idempotency_key;

        let failed = store
            .mark_failed(&id, key, RecordError::new(ErrorKind::Rejected, Some(422), "bad"))
            .unwrap()
            .unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.payload, vec![5]);
        assert_eq!(
            failed.last_error.as_ref().and_then(|e| e.operation),
            Some(OperationKind::Update)
        );
        assert!(store.entry(&id).unwrap().is_none());

        let retried = store.retry_failed(&id, ts(20)).unwrap();
        assert_eq!(retried.sync_status, SyncStatus::PendingUpdate);
        assert!(retried.last_error.is_none());
        assert_eq!(store.entry(&id).unwrap().unwrap().base_version, 1);

        assert!(store.retry_failed(&id, ts(21)).is_err());
    }

    #[test]
    fn discard_removes_record_and_entry() {
        let store = open(&MemoryJournal::new());
        let id = created(&store, "a", 1);
        store.discard(&id).unwrap();
        assert!(store.get(&id).unwrap().is_none());
        assert!(store.outbox().unwrap().is_empty());
        assert!(store.discard(&id).is_err());
    }

    #[test]
    fn acknowledged_delete_removes_record() {
        let store = open(&MemoryJournal::new());
        let id = synced(&store, "a");
        store
            .upsert_optimistic(&id, OperationKind::Delete, vec![], ts(5))
            .unwrap();
        let key = store.entry(&id).unwrap().unwrap().idempotency_key;
        let outcome = store.mark_synced(&id, key, ack(2)).unwrap();
        assert_eq!(outcome, SyncedOutcome::Removed(id.clone()));
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn session_row_persists() {
        let backend = MemoryJournal::new();
        let store = open(&backend);
        let session = AuthSession::new("access", "refresh", ts(9_000));
        store.save_session(&session).unwrap();
        assert_eq!(open(&backend).load_session().unwrap(), Some(session));

        store.clear_session().unwrap();
        assert_eq!(open(&backend).load_session().unwrap(), None);
    }

    #[test]
    fn compact_preserves_state() {
        let backend = MemoryJournal::new();
        let store = open(&backend);
        for n in 0..10 {
            created(&store, &format!("r{}", n), n);
        }
        let before = store.journal_size().unwrap();
        store.compact().unwrap();
        assert!(store.journal_size().unwrap() < before);

        let reopened = open(&backend);
        assert_eq!(reopened.records().unwrap(), store.records().unwrap());
        assert_eq!(reopened.outbox().unwrap(), store.outbox().unwrap());
    }

    #[test]
    fn file_journal_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.tsj");

        let id = {
            let store = DurableStore::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
            let id = created(&store, "a", 1);
            let key = store.entry(&id).unwrap().unwrap().idempotency_key;
            store.schedule_retry(&id, key, ts(77), transient()).unwrap();
            id
        };

        let store = DurableStore::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
        let entry = store.entry(&id).unwrap().unwrap();
        assert_eq!(entry.next_retry_at, Some(ts(77)));
        assert_eq!(entry.attempt, 1);
        assert_eq!(store.in_flight_count(), 0);
    }

    /// Fails the next append after writing half the frame.
    struct FullDisk {
        inner: MemoryJournal,
        armed: bool,
    }

    impl JournalBackend for FullDisk {
        fn read_all(&self) -> StoreResult<Vec<u8>> {
            self.inner.read_all()
        }

        fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
            if std::mem::take(&mut self.armed) {
                self.inner.append(&data[..data.len() / 2])?;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left").into());
            }
            self.inner.append(data)
        }

        fn sync(&mut self) -> StoreResult<()> {
            self.inner.sync()
        }

        fn size(&self) -> StoreResult<u64> {
            self.inner.size()
        }

        fn truncate(&mut self, len: u64) -> StoreResult<()> {
            self.inner.truncate(len)
        }

        fn replace(&mut self, data: &[u8]) -> StoreResult<()> {
            self.inner.replace(data)
        }
    }

    #[test]
    fn write_after_failed_append_survives_restart() {
        let backend = MemoryJournal::new();
        let store = DurableStore::open(Box::new(FullDisk {
            inner: backend.clone(),
            armed: true,
        }))
        .unwrap();

        let a = RecordId::from("a");
        let b = RecordId::from("b");
        assert!(store
            .upsert_optimistic(&a, OperationKind::Create, vec![1], ts(1))
            .is_err());
        assert!(store.get(&a).unwrap().is_none());
        store
            .upsert_optimistic(&b, OperationKind::Create, vec![2], ts(2))
            .unwrap();

        let reopened = open(&backend);
        assert_eq!(reopened.recovery().truncated_bytes, 0);
        assert!(reopened.get(&a).unwrap().is_none());
        assert_eq!(reopened.get(&b).unwrap().unwrap().payload, vec![2]);
        assert_eq!(reopened.outbox().unwrap().len(), 1);
    }

    proptest! {
        /// Cutting the journal anywhere yields the state after some prefix
        /// of the operations, never a half-applied one.
        #[test]
        fn torn_journal_is_a_committed_prefix(ops in 1usize..8, cut in 0usize..2_000) {
            let backend = MemoryJournal::new();
            let store = open(&backend);
            let mut states = vec![(store.records().unwrap(), store.outbox().unwrap())];
            for n in 0..ops {
                let id = RecordId::new(format!("r{}", n % 3));
                let kind = if store.get(&id).unwrap().is_some() {
                    OperationKind::Update
                } else {
                    OperationKind::Create
                };
                store.upsert_optimistic(&id, kind, vec![n as u8], ts(n as u64)).unwrap();
                states.push((store.records().unwrap(), store.outbox().unwrap()));
            }

            let bytes = backend.data();
            let cut = cut.min(bytes.len());
            let torn = MemoryJournal::with_data(bytes[..cut].to_vec());
            let recovered = open(&torn);
            let state = (recovered.records().unwrap(), recovered.outbox().unwrap());
            prop_assert!(states.contains(&state));
            for record in &state.0 {
                prop_assert!(state.1.iter().any(|e| e.record_id == record.id));
            }
        }
    }
}
