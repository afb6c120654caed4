//! CBOR serialization helpers.
//!
//! Handshake and control payloads are CBOR-encoded (RFC 8949) before being
//! placed into a parcel's payload field.

use serde::{de::DeserializeOwned, Serialize};

use crate::MessageError;

/// Serialize a value to CBOR bytes.
///
/// # Errors
///
/// Returns [`MessageError::Serialization`] if the value cannot be serialized.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| MessageError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
///
/// # Errors
///
/// Returns [`MessageError::Deserialization`] if the bytes cannot be
/// deserialized into the target type.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, MessageError> {
    ciborium::from_reader(data)
        .map_err(|e| MessageError::Deserialization(format!("CBOR deserialization failed: {e}")))
}
