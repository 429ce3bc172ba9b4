//! Protocol-level packet shape as produced by the (out-of-scope) encoder.
//!
//! The adapter never constructs the encoded wire frames itself -- it only
//! inspects `Type`/`Id`/`Nsp` to decide whether a packet is eligible for
//! session-recovery logging, and hands the rest off as an opaque payload.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Socket.IO packet types (EIO/SIO framing layer, not this crate's concern
/// beyond telling EVENT apart from everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub ty: PacketType,
    pub nsp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub data: serde_json::Value,
}

impl Packet {
    /// True for `EVENT` packets that the sender doesn't expect an ack for.
    #[must_use]
    pub fn without_acknowledgement(&self) -> bool {
        self.id.is_none()
    }

    /// Candidate for session-recovery logging: an `EVENT`, no ack id, and
    /// the caller didn't mark it volatile (checked by the caller via
    /// `BroadcastOptions`, not stored here).
    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(self.ty, PacketType::Event)
    }

    /// Appends a value to `data` (assumed to be a JSON array), used to tack
    /// on the session-recovery offset as the packet's trailing argument.
    pub fn push_data(&mut self, value: serde_json::Value) {
        match &mut self.data {
            serde_json::Value::Array(items) => items.push(value),
            other => {
                let existing = std::mem::replace(other, serde_json::Value::Null);
                *other = serde_json::Value::Array(vec![existing, value]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_acknowledgement_is_true_iff_id_absent() {
        let mut packet = Packet {
            ty: PacketType::Event,
            nsp: "/".to_owned(),
            id: None,
            data: serde_json::json!(["hello"]),
        };
        assert!(packet.without_acknowledgement());
        packet.id = Some(7);
        assert!(!packet.without_acknowledgement());
    }

    #[test]
    fn push_data_appends_to_array_payload() {
        let mut packet = Packet {
            ty: PacketType::Event,
            nsp: "/".to_owned(),
            id: None,
            data: serde_json::json!(["hello", {"a": 1}]),
        };
        packet.push_data(serde_json::json!("offset-123"));
        assert_eq!(packet.data, serde_json::json!(["hello", {"a": 1}, "offset-123"]));
    }

    #[test]
    fn push_data_wraps_non_array_payload() {
        let mut packet = Packet {
            ty: PacketType::Event,
            nsp: "/".to_owned(),
            id: None,
            data: serde_json::json!("lonely"),
        };
        packet.push_data(serde_json::json!("offset-123"));
        assert_eq!(packet.data, serde_json::json!(["lonely", "offset-123"]));
    }
}
