//! Body encoding off the async executor.
//!
//! Small bodies are encoded inline. Anything larger than
//! [`OFFLOAD_THRESHOLD`] is moved to the blocking pool: the value goes in,
//! bytes come out, and nothing is shared with the caller in between.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tidesync_protocol::{from_cbor, to_cbor};

/// Body size above which (de)serialization runs on the blocking pool.
pub const OFFLOAD_THRESHOLD: usize = 64 * 1024;

/// Encodes a value as CBOR.
///
/// `size_hint` is the expected body size, usually the payload length.
pub async fn encode<T>(value: T, size_hint: usize) -> SyncResult<Vec<u8>>
where
    T: Serialize + Send + 'static,
{
    if size_hint <= OFFLOAD_THRESHOLD {
        return Ok(to_cbor(&value)?);
    }
    tokio::task::spawn_blocking(move || to_cbor(&value))
        .await
        .map_err(|e| SyncError::Serialization(format!("encode task failed: {}", e)))?
        .map_err(SyncError::from)
}

/// Decodes a CBOR body.
pub async fn decode<T>(bytes: Vec<u8>) -> SyncResult<T>
where
    T: DeserializeOwned + Send + 'static,
{
    if bytes.len() <= OFFLOAD_THRESHOLD {
        return Ok(from_cbor(&bytes)?);
    }
    tokio::task::spawn_blocking(move || from_cbor(&bytes))
        .await
        .map_err(|e| SyncError::Serialization(format!("decode task failed: {}", e)))?
        .map_err(SyncError::from)
}
