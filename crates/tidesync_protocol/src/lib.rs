//! # tidesync protocol
//!
//! Data model and wire types shared by the tidesync store and engine.
//!
//! This crate provides:
//! - [`Record`] and [`SyncStatus`] for entities under sync control
//! - [`OutboxEntry`] with the coalescing rules for queued mutations
//! - [`AuthSession`] for the bearer-token session
//! - Status classification for remote responses
//! - Realtime [`Frame`]s and the request/response bodies
//! - Conflict resolution policies (Last-Write-Wins, optimistic rollback)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod error;
mod outbox;
mod record;
mod session;
mod status;
mod time;
mod wire;

pub use codec::{from_cbor, to_cbor};
pub use conflict::{
    ConflictCase, ConflictPolicy, ConflictResolver, LastWriteWins, LocalPending,
    OptimisticRollback, RemoteSnapshot, Resolution,
};
pub use error::{ProtocolError, ProtocolResult};
pub use outbox::{Coalesce, IdempotencyKey, OperationKind, OutboxEntry};
pub use record::{ErrorKind, Record, RecordError, RecordId, SyncStatus};
pub use session::AuthSession;
pub use status::{classify_status, StatusClass};
pub use time::Timestamp;
pub use wire::{ConnectionPhase, ErrorBody, Frame, RefreshRequest, TokenGrant, WriteAck, WriteRequest};
