//! File-based journal backend.

use crate::backend::JournalBackend;
use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A journal stored in a single file.
///
/// # Durability
///
/// - `sync()` calls `File::sync_data()`
/// - `replace()` writes a sibling temp file, syncs it and renames it over
///   the journal
///
/// # Locking
///
/// The file is locked exclusively for the lifetime of the backend, so at
/// most one process writes a journal at a time.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
}

impl FileJournal {
    /// Opens or creates a journal file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds the file.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = Self::open_locked(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Returns the journal path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_locked(path: &Path) -> StoreResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(path.to_path_buf()))?;
        Ok(file)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".compact");
        PathBuf::from(name)
    }
}

impl JournalBackend for FileJournal {
    fn read_all(&self) -> StoreResult<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        Ok(offset)
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StoreResult<()> {
        let temp = self.temp_path();
        {
            let mut out = File::create(&temp)?;
            out.write_all(data)?;
            out.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        // The old handle (and its lock) points at the unlinked inode.
        let _ = FileExt::unlock(&self.file);
        self.file = Self::open_locked(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.tsj");

        {
            let mut journal = FileJournal::open(&path).unwrap();
            journal.append(b"persist").unwrap();
            journal.sync().unwrap();
        }

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.read_all().unwrap(), b"persist");
        assert_eq!(journal.size().unwrap(), 7);
    }

    #[test]
    fn creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("journal.tsj");
        FileJournal::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.tsj");
        let _first = FileJournal::open(&path).unwrap();
        assert!(matches!(FileJournal::open(&path), Err(StoreError::Locked(_))));
    }

    #[test]
    fn replace_swaps_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.tsj");
        let mut journal = FileJournal::open(&path).unwrap();
        journal.append(b"old old old").unwrap();
        journal.replace(b"new").unwrap();
        assert_eq!(journal.read_all().unwrap(), b"new");

        journal.append(b"+").unwrap();
        journal.sync().unwrap();
        drop(journal);
        assert_eq!(fs::read(&path).unwrap(), b"new+");
    }

    #[test]
    fn truncate_cuts_tail() {
        let dir = tempdir().unwrap();
        let mut journal = FileJournal::open(&dir.path().join("j")).unwrap();
        journal.append(b"0123456789").unwrap();
        journal.truncate(4).unwrap();
        assert_eq!(journal.read_all().unwrap(), b"0123");
    }
}
