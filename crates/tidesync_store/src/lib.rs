//! # tidesync store
//!
//! Durable store for records under sync control.
//!
//! The store is the single source of truth the rest of the engine reads
//! and writes. It keeps three tables in memory (records, outbox entries,
//! the auth session) and persists every change as one checksummed frame
//! in an append-only journal.
//!
//! ## Design Principles
//!
//! - One store operation is one journal frame is one commit
//! - In-memory state changes only after the frame is durable
//! - A torn tail frame is discarded on recovery
//! - Journal backends are opaque byte stores
//!
//! ## Example
//!
//! ```rust
//! use tidesync_store::{DurableStore, LocalDataSource, MemoryJournal};
//! use tidesync_protocol::{OperationKind, RecordId, SyncStatus, Timestamp};
//!
//! let store = DurableStore::open(Box::new(MemoryJournal::new())).unwrap();
//! let id = RecordId::from("a");
//! let record = store
//!     .upsert_optimistic(&id, OperationKind::Create, b"hello".to_vec(), Timestamp::now())
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(record.sync_status, SyncStatus::PendingCreate);
//! assert_eq!(store.outbox().unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod memory;
mod source;
mod state;
mod store;

pub use backend::JournalBackend;
pub use error::{StoreError, StoreResult};
pub use file::FileJournal;
pub use journal::{Journal, RecoveryReport};
pub use memory::MemoryJournal;
pub use source::{LocalDataSource, ResolutionOutcome, SyncedOutcome};
pub use state::{Mutation, StoreState, Transaction};
pub use store::DurableStore;
