//! Compact command implementation.

use std::path::Path;
use tidesync_store::{DurableStore, FileJournal, LocalDataSource};

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Transactions replayed before compaction.
    pub transactions: usize,
    /// Live records carried into the snapshot.
    pub records: usize,
    /// Outbox entries carried into the snapshot.
    pub entries: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction (unchanged on a dry run).
    pub bytes_after: u64,
}

/// Compacts the journal at `path`, or only measures it on a dry run.
pub fn compact(path: &Path, dry_run: bool) -> Result<CompactStats, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No journal found at {:?}", path).into());
    }

    let store = DurableStore::open(Box::new(FileJournal::open(path)?))?;
    let bytes_before = store.journal_size()?;
    if !dry_run {
        store.compact()?;
    }

    Ok(CompactStats {
        transactions: store.recovery().transactions,
        records: store.records()?.len(),
        entries: store.outbox()?.len(),
        bytes_before,
        bytes_after: store.journal_size()?,
    })
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting journal at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(path, dry_run)?;

    println!("Compaction:");
    println!("  Transactions: {}", stats.transactions);
    println!("  Records:      {}", stats.records);
    println!("  Outbox:       {}", stats.entries);
    println!();
    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    if !dry_run {
        println!(
            "  Space saved: {} bytes",
            stats.bytes_before.saturating_sub(stats.bytes_after)
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tidesync_protocol::{OperationKind, RecordId, Timestamp};

    #[test]
    fn compaction_shrinks_and_preserves_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.tsj");
        let id = RecordId::from("a");
        {
            let store = DurableStore::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
            for n in 0..20u8 {
                let kind = if n == 0 {
                    OperationKind::Create
                } else {
                    OperationKind::Update
                };
                store
                    .upsert_optimistic(&id, kind, vec![n; 32], Timestamp::from_millis(u64::from(n)))
                    .unwrap();
            }
        }

        let dry = compact(&path, true).unwrap();
        assert_eq!(dry.bytes_before, dry.bytes_after);

        let stats = compact(&path, false).unwrap();
        assert_eq!(stats.transactions, 20);
        assert!(stats.bytes_after < stats.bytes_before);

        let store = DurableStore::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
        assert_eq!(store.recovery().transactions, 1);
        assert_eq!(store.get(&id).unwrap().unwrap().payload, vec![19; 32]);
        assert_eq!(store.outbox().unwrap().len(), 1);
    }
}
