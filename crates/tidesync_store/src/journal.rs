//! Append-only transaction journal.
//!
//! ## Frame Format
//!
//! ```text
//! magic "TSJ1" (4) | length u32 LE (4) | CBOR transaction (length) | CRC32 LE (4)
//! ```
//!
//! The CRC covers everything before it. Recovery reads frames in order and
//! stops at the first frame that is incomplete, has the wrong magic or
//! fails its checksum; the journal is truncated there. A frame with a
//! valid checksum that does not decode is real corruption and is reported
//! as an error.

use crate::backend::JournalBackend;
use crate::error::{StoreError, StoreResult};
use crate::state::{Mutation, Transaction};
use tidesync_protocol::{from_cbor, to_cbor};

/// Magic bytes identifying a journal frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TSJ1";

/// magic (4) + length (4).
const HEADER_SIZE: usize = 8;

/// CRC size.
const CRC_SIZE: usize = 4;

/// What recovery found when a journal was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Committed transactions replayed.
    pub transactions: usize,
    /// Bytes of torn tail that were cut off.
    pub truncated_bytes: u64,
}

/// Writes and replays committed transactions.
pub struct Journal {
    backend: Box<dyn JournalBackend>,
    next_seq: u64,
    /// Set when a failed commit could not be rolled back. The tail may hold
    /// a partial frame, so nothing more may be appended after it.
    poisoned: bool,
}

impl Journal {
    /// Opens a journal, replaying every committed transaction.
    ///
    /// A torn tail is cut off before this returns, so the next commit
    /// starts at a frame boundary.
    pub fn open(
        mut backend: Box<dyn JournalBackend>,
    ) -> StoreResult<(Self, Vec<Transaction>, RecoveryReport)> {
        let bytes = backend.read_all()?;
        let (transactions, valid_len) = decode_frames(&bytes)?;

        let mut report = RecoveryReport {
            transactions: transactions.len(),
            truncated_bytes: 0,
        };
        if valid_len < bytes.len() {
            report.truncated_bytes = (bytes.len() - valid_len) as u64;
            tracing::warn!(
                truncated_bytes = report.truncated_bytes,
                "discarding torn journal tail"
            );
            backend.truncate(valid_len as u64)?;
        }

        let next_seq = transactions.last().map_or(1, |tx| tx.seq + 1);
        Ok((
            Self {
                backend,
                next_seq,
                poisoned: false,
            },
            transactions,
            report,
        ))
    }

    /// Durably commits a group of mutations as one transaction.
    ///
    /// Returns the committed transaction once it is synced. If the append
    /// or the sync fails, the journal is cut back to where the frame began
    /// so the next commit does not land behind a partial frame.
    pub fn commit(&mut self, mutations: Vec<Mutation>) -> StoreResult<Transaction> {
        if self.poisoned {
            return Err(StoreError::Poisoned);
        }
        let tx = Transaction {
            seq: self.next_seq,
            mutations,
        };
        let frame = encode_frame(&tx)?;
        let offset = self.backend.size()?;
        if let Err(err) = self.write_frame(&frame) {
            if let Err(rollback) = self.backend.truncate(offset) {
                tracing::error!(
                    offset,
                    error = %rollback,
                    "failed to roll back partial journal frame"
                );
                self.poisoned = true;
            }
            return Err(err);
        }
        self.next_seq += 1;
        Ok(tx)
    }

    fn write_frame(&mut self, frame: &[u8]) -> StoreResult<()> {
        self.backend.append(frame)?;
        self.backend.sync()
    }

    /// Replaces the journal with a single snapshot transaction.
    pub fn rewrite(&mut self, snapshot: Vec<Mutation>) -> StoreResult<Transaction> {
        if self.poisoned {
            return Err(StoreError::Poisoned);
        }
        let tx = Transaction {
            seq: self.next_seq,
            mutations: snapshot,
        };
        let frame = encode_frame(&tx)?;
        self.backend.replace(&frame)?;
        self.next_seq += 1;
        Ok(tx)
    }

    /// Returns the journal size in bytes.
    pub fn size(&self) -> StoreResult<u64> {
        self.backend.size()
    }
}

fn encode_frame(tx: &Transaction) -> StoreResult<Vec<u8>> {
    let payload = to_cbor(tx)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Corrupted("transaction larger than 4 GiB".into()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Decodes frames until the first bad one.
///
/// Returns the transactions and the length of the valid prefix.
fn decode_frames(bytes: &[u8]) -> StoreResult<(Vec<Transaction>, usize)> {
    let mut transactions = Vec::new();
    let mut offset = 0usize;

    while bytes.len() - offset >= HEADER_SIZE {
        let header = &bytes[offset..offset + HEADER_SIZE];
        if header[..4] != FRAME_MAGIC {
            break;
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let end = offset + HEADER_SIZE + len;
        if end + CRC_SIZE > bytes.len() {
            break;
        }

        let stored = u32::from_le_bytes([bytes[end], bytes[end + 1], bytes[end + 2], bytes[end + 3]]);
        if compute_crc32(&bytes[offset..end]) != stored {
            break;
        }

        let tx: Transaction = from_cbor(&bytes[offset + HEADER_SIZE..end]).map_err(|e| {
            StoreError::Corrupted(format!("frame at offset {} does not decode: {}", offset, e))
        })?;
        transactions.push(tx);
        offset = end + CRC_SIZE;
    }

    Ok((transactions, offset))
}

/// Computes a CRC32 checksum (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
