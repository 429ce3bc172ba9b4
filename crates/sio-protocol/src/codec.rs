//! `ClusterMessageCodec`: encode/decode for the wire forms the channel
//! transports use. MessagePack is the default; a leading `{` byte is
//! treated as JSON for backward compatibility with older peers that only
//! ever spoke JSON (§4.2.2, §9 open question 2).

use crate::message::{ClusterMessage, MessageCodecError};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Message(#[from] MessageCodecError),
    #[error("messagepack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("messagepack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes with MessagePack -- the default wire form.
pub fn encode(msg: &ClusterMessage) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Encodes as JSON text. Kept for peers/tests that want a human-readable
/// payload; the channel adapter only ever emits this as a compatibility
/// fallback, never by default.
pub fn encode_json(msg: &ClusterMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decodes a payload received off the bus. Dispatches to JSON when the
/// first byte is ASCII `{`, otherwise assumes MessagePack.
///
/// This heuristic is a backward-compat shim inherited from the system
/// being adapted, not a format-detection guarantee -- a MessagePack
/// payload could theoretically start with a byte that collides with
/// `{` (0x7B), but that byte only ever begins a msgpack fixmap of size
/// 11, which never occurs for our message shapes (the top-level map
/// always has exactly 3 or 4 fields).
pub fn decode(payload: &[u8]) -> Result<ClusterMessage, CodecError> {
    if payload.first() == Some(&b'{') {
        Ok(serde_json::from_slice(payload)?)
    } else {
        Ok(rmp_serde::from_slice(payload)?)
    }
}
