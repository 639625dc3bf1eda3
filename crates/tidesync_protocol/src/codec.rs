//! CBOR helpers over serde.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}
