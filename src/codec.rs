//! Payload codec shared by both adapters
//!
//! Outbound: binary passes through, text becomes UTF-8 bytes, structured
//! values are rendered to a JSON string and then re-encoded through the
//! text rule. Inbound: payload bytes are always interpreted as UTF-8 text;
//! no structural JSON decoding is attempted.

use thiserror::Error;

use crate::message::Payload;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The structured payload could not be rendered to JSON.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Inbound payload bytes were not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Renders a payload to wire bytes.
pub fn encode(payload: &Payload) -> Result<Vec<u8>, CodecError> {
    match payload {
        Payload::Binary(bytes) => Ok(bytes.clone()),
        Payload::Text(text) => Ok(text.as_bytes().to_vec()),
        Payload::Value(value) => {
            let text = serde_json::to_string(value)?;
            encode(&Payload::Text(text))
        }
    }
}

/// Interprets wire bytes as a UTF-8 text payload.
pub fn decode(bytes: &[u8]) -> Result<Payload, CodecError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(Payload::Text(text.to_string()))
}
