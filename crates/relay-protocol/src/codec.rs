//! Codec for encoding and decoding bus payloads.
//!
//! Payloads are UTF-8 JSON objects carrying a single [`Message`].

use bytes::Bytes;
use thiserror::Error;

use crate::message::Message;

/// Maximum payload size produced by [`encode`] and accepted by [`decode`]
/// (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload exceeds maximum size.
    #[error("Payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Malformed JSON, missing field or unknown kind.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Structurally valid payload with invalid contents.
    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails or the payload would be too large
/// to decode.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_vec(message).map_err(CodecError::Encode)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    Ok(Bytes::from(payload))
}

/// Decode a message from bytes.
///
/// # Errors
///
/// Returns an error if the payload is too large, is not valid JSON, misses a
/// required field, names an unknown kind or carries an empty id.
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(data.len()));
    }

    let message: Message = serde_json::from_slice(data).map_err(CodecError::Decode)?;

    if message.id().is_empty() {
        return Err(CodecError::Invalid("empty id".to_string()));
    }

    Ok(message)
}
