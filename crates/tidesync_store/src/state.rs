//! Store tables and the mutations that change them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tidesync_protocol::{AuthSession, OutboxEntry, Record, RecordId, Timestamp};

/// A single change to one table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert or replace a record.
    PutRecord(Record),
    /// Remove a record.
    RemoveRecord(RecordId),
    /// Insert or replace an outbox entry.
    PutEntry(OutboxEntry),
    /// Remove an outbox entry.
    RemoveEntry(RecordId),
    /// Install the session row.
    PutSession(AuthSession),
    /// Clear the session row.
    ClearSession,
}

/// A group of mutations committed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Commit sequence number.
    pub seq: u64,
    /// Mutations, applied in order.
    pub mutations: Vec<Mutation>,
}

/// The in-memory tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreState {
    /// Records table keyed by id.
    pub records: BTreeMap<RecordId, Record>,
    /// Outbox table keyed by record id (at most one entry per record).
    pub entries: BTreeMap<RecordId, OutboxEntry>,
    /// Single-row session table.
    pub session: Option<AuthSession>,
}

impl StoreState {
    /// Applies a committed transaction.
    pub fn apply(&mut self, tx: &Transaction) {
        for mutation in &tx.mutations {
            match mutation {
                Mutation::PutRecord(record) => {
                    self.records.insert(record.id.clone(), record.clone());
                }
                Mutation::RemoveRecord(id) => {
                    self.records.remove(id);
                }
                Mutation::PutEntry(entry) => {
                    self.entries.insert(entry.record_id.clone(), entry.clone());
                }
                Mutation::RemoveEntry(id) => {
                    self.entries.remove(id);
                }
                Mutation::PutSession(session) => self.session = Some(session.clone()),
                Mutation::ClearSession => self.session = None,
            }
        }
    }

    /// Builds the mutations that recreate this state from empty.
    pub fn snapshot(&self) -> Vec<Mutation> {
        let mut mutations: Vec<Mutation> = self
            .records
            .values()
            .cloned()
            .map(Mutation::PutRecord)
            .collect();
        mutations.extend(self.entries.values().cloned().map(Mutation::PutEntry));
        if let Some(session) = &self.session {
            mutations.push(Mutation::PutSession(session.clone()));
        }
        mutations
    }

    /// Returns entries eligible at `now`, oldest first.
    ///
    /// Entries of records parked in conflict are skipped; they wait for
    /// resolution rather than redispatch.
    pub fn due_entries(&self, now: Timestamp) -> Vec<&OutboxEntry> {
        let mut due: Vec<&OutboxEntry> = self
            .entries
            .values()
            .filter(|entry| entry.is_due(now))
            .filter(|entry| {
                self.records
                    .get(&entry.record_id)
                    .map_or(true, |r| r.sync_status.is_pending())
            })
            .collect();
        due.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        due
    }
}
