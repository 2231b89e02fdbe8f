//! Bincode formatter for opaque payload values.
//!
//! Parameter values and return values travel as pre-serialized bytes; the
//! core never inspects them. These helpers are what the typed contract
//! builders and tests use to produce and consume those bytes.

use crate::error::{CodecError, Result};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Encode a payload value into bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let vec = bincode::serialize(value).map_err(CodecError::from)?;
    Ok(Bytes::from(vec))
}

/// Decode a payload value from bytes.
///
/// # Errors
///
/// Returns an error if the data is invalid or cannot be deserialized as `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data)
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))
        .map_err(Into::into)
}
