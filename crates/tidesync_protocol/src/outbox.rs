//! Outbox entries: durable, queued remote operations.

use crate::record::RecordId;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Record is new on the server.
    Create,
    /// Record exists on the server and changes.
    Update,
    /// Record is removed from the server.
    Delete,
}

impl OperationKind {
    /// Returns a short lowercase name, used in logs and request paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of one logical remote operation.
///
/// Retries of the same entry reuse the key so the server applies the
/// operation at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(uuid::Uuid);

impl IdempotencyKey {
    /// Generates a new random key.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parses a key from its hyphenated string form.
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Outcome of folding a new local edit into an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesce {
    /// The entry now carries the new edit.
    Merged,
    /// The edits cancel out (create then delete before any dispatch);
    /// both the entry and the record should be dropped.
    Cancelled,
}

/// One durable, queued remote operation.
///
/// # Invariants
///
/// - At most one entry exists per record
/// - `attempt` increments only on a dispatch that fails
/// - `created_at` never changes once set, so replay order is stable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Record this operation applies to.
    pub record_id: RecordId,
    /// Operation kind.
    pub operation_kind: OperationKind,
    /// Payload as of the last local edit.
    pub payload_snapshot: Vec<u8>,
    /// Idempotency key sent with every dispatch of this operation.
    pub idempotency_key: IdempotencyKey,
    /// When the entry was first queued.
    pub created_at: Timestamp,
    /// Earliest time of the next dispatch; `None` means immediately.
    pub next_retry_at: Option<Timestamp>,
    /// Failed dispatches so far.
    pub attempt: u32,
    /// Server version the local change was made against.
    pub base_version: u64,
}

impl OutboxEntry {
    /// Creates a fresh entry.
    pub fn new(
        record_id: RecordId,
        operation_kind: OperationKind,
        payload_snapshot: Vec<u8>,
        created_at: Timestamp,
        base_version: u64,
    ) -> Self {
        Self {
            record_id,
            operation_kind,
            payload_snapshot,
            idempotency_key: IdempotencyKey::generate(),
            created_at,
            next_retry_at: None,
            attempt: 0,
            base_version,
        }
    }

    /// Returns true if the entry may be dispatched at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Folds a newer local edit into this entry.
    ///
    /// The payload is replaced and `created_at` is preserved. `attempt` and
    /// the backoff are reset only when the operation kind changes. The
    /// idempotency key is always renewed: the merged entry is a different
    /// logical operation from anything already sent.
    ///
    /// `dispatched` reports whether the entry is currently in flight.
    pub fn coalesce(&mut self, kind: OperationKind, payload: Vec<u8>, dispatched: bool) -> Coalesce {
        use OperationKind::{Create, Delete, Update};

        let merged = match (self.operation_kind, kind) {
            (Create, Delete) if self.attempt == 0 && !dispatched => return Coalesce::Cancelled,
            (Create, Delete) | (Update, Delete) | (Delete, Delete) => Delete,
            (Create, _) => Create,
            (Update, _) | (Delete, _) => Update,
        };

        if merged != self.operation_kind {
            self.attempt = 0;
            self.next_retry_at = None;
        }
        self.operation_kind = merged;
        self.payload_snapshot = payload;
        self.idempotency_key = IdempotencyKey::generate();
        Coalesce::Merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(kind: OperationKind) -> OutboxEntry {
        OutboxEntry::new(
            RecordId::from("r1"),
            kind,
            vec![1],
            Timestamp::from_millis(100),
            3,
        )
    }

    #[test]
    fn update_after_create_stays_create() {
        let mut e = entry(OperationKind::Create);
        e.attempt = 2;
        let key = e.idempotency_key;

        assert_eq!(e.coalesce(OperationKind::Update, vec![9], false), Coalesce::Merged);
        assert_eq!(e.operation_kind, OperationKind::Create);
        assert_eq!(e.payload_snapshot, vec![9]);
        assert_eq!(e.attempt, 2);
        assert_eq!(e.created_at, Timestamp::from_millis(100));
        assert_ne!(e.idempotency_key, key);
    }

    #[test]
    fn delete_after_undispatched_create_cancels() {
        let mut e = entry(OperationKind::Create);
        assert_eq!(e.coalesce(OperationKind::Delete, vec![], false), Coalesce::Cancelled);
    }

    #[test]
    fn delete_after_attempted_create_becomes_delete() {
        let mut e = entry(OperationKind::Create);
        e.attempt = 1;
        e.next_retry_at = Some(Timestamp::from_millis(5_000));

        assert_eq!(e.coalesce(OperationKind::Delete, vec![], false), Coalesce::Merged);
        assert_eq!(e.operation_kind, OperationKind::Delete);
        assert_eq!(e.attempt, 0);
        assert_eq!(e.next_retry_at, None);
    }

    #[test]
    fn delete_after_in_flight_create_becomes_delete() {
        let mut e = entry(OperationKind::Create);
        assert_eq!(e.coalesce(OperationKind::Delete, vec![], true), Coalesce::Merged);
        assert_eq!(e.operation_kind, OperationKind::Delete);
    }

    #[test]
    fn edit_after_delete_becomes_update() {
        let mut e = entry(OperationKind::Delete);
        e.attempt = 4;
        e.coalesce(OperationKind::Update, vec![7], false);
        assert_eq!(e.operation_kind, OperationKind::Update);
        assert_eq!(e.attempt, 0);
    }

    #[test]
    fn due_time() {
        let mut e = entry(OperationKind::Update);
        assert!(e.is_due(Timestamp::ZERO));
        e.next_retry_at = Some(Timestamp::from_millis(50));
        assert!(!e.is_due(Timestamp::from_millis(49)));
        assert!(e.is_due(Timestamp::from_millis(50)));
    }

    fn kind_strategy() -> impl Strategy<Value = OperationKind> {
        prop_oneof![
            Just(OperationKind::Create),
            Just(OperationKind::Update),
            Just(OperationKind::Delete),
        ]
    }

    proptest! {
        #[test]
        fn coalescing_keeps_created_at_and_latest_payload(
            first in kind_strategy(),
            edits in prop::collection::vec((kind_strategy(), any::<u8>()), 1..8),
        ) {
            let mut e = entry(first);
            e.attempt = 1;
            for (kind, byte) in edits {
                if e.coalesce(kind, vec![byte], false) == Coalesce::Cancelled {
                    return Ok(());
                }
                prop_assert_eq!(e.created_at, Timestamp::from_millis(100));
                prop_assert_eq!(&e.payload_snapshot, &vec![byte]);
            }
        }
    }
}
