//! Conflict detection and resolution.
//!
//! Resolvers reason only over the two snapshots already held locally;
//! they never touch the network, which keeps them deterministic.

use crate::outbox::OperationKind;
use crate::record::RecordId;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Remote state of a record as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Remote payload; `None` if the record was deleted remotely.
    pub payload: Option<Vec<u8>>,
    /// Remote version.
    pub version: u64,
    /// Remote time of the last write.
    pub updated_at: Timestamp,
}

impl RemoteSnapshot {
    /// Returns true if the remote side deleted the record.
    pub fn is_deleted(&self) -> bool {
        self.payload.is_none()
    }
}

/// The local change that failed its version precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPending {
    /// Pending operation kind.
    pub operation_kind: OperationKind,
    /// Pending payload.
    pub payload: Vec<u8>,
    /// Local time of the edit.
    pub updated_at: Timestamp,
    /// Version the edit was made against.
    pub base_version: u64,
}

/// A conflict between a pending local change and the remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCase {
    /// Record in conflict.
    pub record_id: RecordId,
    /// Local side.
    pub local: LocalPending,
    /// Remote side.
    pub remote: RemoteSnapshot,
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Re-queue the local side against the remote version. The payload may
    /// be the local payload or a merge of both sides.
    KeepLocal {
        /// Payload to re-dispatch.
        payload: Vec<u8>,
    },
    /// The remote snapshot becomes the final state and the pending local
    /// change is discarded.
    AcceptRemote {
        /// Whether the caller must be told its optimistic change was undone.
        rollback: bool,
    },
    /// Leave the record in conflict for the application to settle later.
    Defer,
}

/// A conflict resolution strategy.
pub trait ConflictResolver: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Decides the outcome of a conflict.
    fn resolve(&self, case: &ConflictCase) -> Resolution;
}

/// The side with the later timestamp wins; ties go to the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn name(&self) -> &'static str {
        "last-write-wins"
    }

    fn resolve(&self, case: &ConflictCase) -> Resolution {
        if case.local.updated_at > case.remote.updated_at {
            Resolution::KeepLocal {
                payload: case.local.payload.clone(),
            }
        } else {
            Resolution::AcceptRemote { rollback: false }
        }
    }
}

/// The local optimistic change is always undone in favour of the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticRollback;

impl ConflictResolver for OptimisticRollback {
    fn name(&self) -> &'static str {
        "optimistic-rollback"
    }

    fn resolve(&self, _case: &ConflictCase) -> Resolution {
        Resolution::AcceptRemote { rollback: true }
    }
}

/// Policy for automatic conflict resolution.
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    /// Timestamp comparison, see [`LastWriteWins`].
    #[default]
    LastWriteWins,
    /// Server always wins and the caller is notified, see [`OptimisticRollback`].
    OptimisticRollback,
    /// An injected strategy.
    Custom(Arc<dyn ConflictResolver>),
}

impl ConflictPolicy {
    /// Returns the resolver implementing this policy.
    pub fn resolver(&self) -> &dyn ConflictResolver {
        match self {
            ConflictPolicy::LastWriteWins => &LastWriteWins,
            ConflictPolicy::OptimisticRollback => &OptimisticRollback,
            ConflictPolicy::Custom(resolver) => resolver.as_ref(),
        }
    }

    /// Resolves a conflict according to this policy.
    pub fn resolve(&self, case: &ConflictCase) -> Resolution {
        self.resolver().resolve(case)
    }
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::LastWriteWins => f.write_str("LastWriteWins"),
            ConflictPolicy::OptimisticRollback => f.write_str("OptimisticRollback"),
            ConflictPolicy::Custom(resolver) => {
                f.debug_tuple("Custom").field(&resolver.name()).finish()
            }
        }
    }
}
