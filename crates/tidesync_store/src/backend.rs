//! Journal backend trait definition.

use crate::error::StoreResult;

/// A low-level byte store holding the journal.
///
/// Backends are **opaque byte stores**. They do not understand frames,
/// transactions or records; the [`crate::Journal`] owns the format.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns exactly the bytes appended so far
/// - After `sync` returns, appended data survives process termination
/// - Backends must be `Send + Sync`
pub trait JournalBackend: Send + Sync {
    /// Reads the whole journal.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Makes all appended data durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StoreResult<u64>;

    /// Drops everything after `len` bytes. Used to cut a torn tail.
    fn truncate(&mut self, len: u64) -> StoreResult<()>;

    /// Atomically replaces the whole journal with `data`.
    ///
    /// Either the old or the new content is observable after a crash,
    /// never a mix.
    fn replace(&mut self, data: &[u8]) -> StoreResult<()>;
}
