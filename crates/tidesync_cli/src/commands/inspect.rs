//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use tidesync_protocol::{OutboxEntry, Record, Timestamp};
use tidesync_store::{DurableStore, FileJournal, LocalDataSource};

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Transactions replayed on open.
    pub transactions: usize,
    /// Bytes of torn tail discarded on open.
    pub truncated_bytes: u64,
    /// Records, ordered by id.
    pub records: Vec<RecordSummary>,
    /// Outbox entries in dispatch order.
    pub outbox: Vec<EntrySummary>,
    /// Session row, without its tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSummary>,
}

/// One record row.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Record id.
    pub id: String,
    /// Sync status.
    pub status: String,
    /// Last acknowledged server version.
    pub version: u64,
    /// Last local or server write.
    pub updated_at: Timestamp,
    /// Failed attempts for the pending change.
    pub attempts: u32,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// Payload bytes (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Last error, rendered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One outbox row.
#[derive(Debug, Serialize)]
pub struct EntrySummary {
    /// Record id.
    pub record_id: String,
    /// Pending operation.
    pub operation: String,
    /// Idempotency key of the next send.
    pub idempotency_key: String,
    /// Attempts so far.
    pub attempt: u32,
    /// Version the change was based on.
    pub base_version: u64,
    /// Earliest next send, if backing off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<Timestamp>,
}

/// Session row without credentials.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    /// Access token expiry.
    pub expires_at: Timestamp,
    /// True if the access token has already expired.
    pub expired: bool,
}

impl RecordSummary {
    fn from_record(record: Record, payloads: bool) -> Self {
        Self {
            id: record.id.to_string(),
            status: format!("{:?}", record.sync_status),
            version: record.version,
            updated_at: record.updated_at,
            attempts: record.attempt_count,
            payload_size: record.payload.len(),
            last_error: record.last_error.as_ref().map(ToString::to_string),
            payload: payloads.then_some(record.payload),
        }
    }
}

impl From<OutboxEntry> for EntrySummary {
    fn from(entry: OutboxEntry) -> Self {
        Self {
            record_id: entry.record_id.to_string(),
            operation: entry.operation_kind.to_string(),
            idempotency_key: entry.idempotency_key.to_string(),
            attempt: entry.attempt,
            base_version: entry.base_version,
            next_retry_at: entry.next_retry_at,
        }
    }
}

/// Collects the inspection result for a journal.
pub fn inspect(path: &Path, payloads: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No journal found at {:?}", path).into());
    }

    let store = DurableStore::open(Box::new(FileJournal::open(path)?))?;
    let recovery = store.recovery();
    let now = Timestamp::now();

    Ok(InspectResult {
        path: path.display().to_string(),
        journal_size: store.journal_size()?,
        transactions: recovery.transactions,
        truncated_bytes: recovery.truncated_bytes,
        records: store
            .records()?
            .into_iter()
            .map(|r| RecordSummary::from_record(r, payloads))
            .collect(),
        outbox: store.outbox()?.into_iter().map(EntrySummary::from).collect(),
        session: store.load_session()?.map(|s| SessionSummary {
            expires_at: s.expires_at,
            expired: s.is_expired(now),
        }),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, payloads: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, payloads)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("tidesync Journal Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {} bytes", result.journal_size);
    println!("Transactions replayed: {}", result.transactions);
    if result.truncated_bytes > 0 {
        println!("Torn tail discarded: {} bytes", result.truncated_bytes);
    }
    println!();

    match &result.session {
        Some(session) if session.expired => println!("Session: expired at {}", session.expires_at),
        Some(session) => println!("Session: active until {}", session.expires_at),
        None => println!("Session: none"),
    }
    println!();

    println!("Records ({}):", result.records.len());
    for record in &result.records {
        println!(
            "  {:<24} {:<14} v{:<4} {} bytes",
            record.id, record.status, record.version, record.payload_size
        );
        if let Some(error) = &record.last_error {
            println!("      last error: {}", error);
        }
        if let Some(payload) = &record.payload {
            println!("      payload: {:02x?}", payload);
        }
    }
    println!();

    println!("Outbox ({}):", result.outbox.len());
    for entry in &result.outbox {
        print!(
            "  {:<24} {:<7} attempt {} base v{}",
            entry.record_id, entry.operation, entry.attempt, entry.base_version
        );
        match entry.next_retry_at {
            Some(at) => println!(" retry at {}", at),
            None => println!(),
        }
    }
}
