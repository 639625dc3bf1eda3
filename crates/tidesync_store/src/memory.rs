//! In-memory journal backend.

use crate::backend::JournalBackend;
use crate::error::StoreResult;
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;

/// An in-memory journal.
///
/// Suitable for unit tests, integration tests and ephemeral stores.
/// Clones share the same buffer, so a test can drop a store and reopen
/// another one over the same bytes to simulate a restart.
///
/// # Example
///
/// ```rust
/// use tidesync_store::{JournalBackend, MemoryJournal};
///
/// let mut journal = MemoryJournal::new();
/// let handle = journal.clone();
/// journal.append(b"frame").unwrap();
/// assert_eq!(handle.data(), b"frame");
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryJournal {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a journal over pre-existing bytes.
    ///
    /// Useful for testing recovery from a torn write.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the journal bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl JournalBackend for MemoryJournal {
    fn read_all(&self) -> StoreResult<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn append(&mut self, bytes: &[u8]) -> StoreResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        let mut data = self.data.write();
        if len > data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot truncate to {} bytes, journal has {}", len, data.len()),
            )
            .into());
        }
        data.truncate(len as usize);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> StoreResult<()> {
        *self.data.write() = bytes.to_vec();
        Ok(())
    }
}
