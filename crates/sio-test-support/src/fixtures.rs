//! Small builders for the protocol types tests construct constantly,
//! trimming the boilerplate every `sio-cluster`/`sio-redis-adapter`/
//! `sio-stream-adapter` test otherwise repeats by hand.

use sio_protocol::{BroadcastOptions, Packet, PacketType, Room};

/// A plain `EVENT` packet with no ack id, carrying `args` as its data
/// array -- the common case eligible for session-recovery logging.
#[must_use]
pub fn event_packet(args: Vec<serde_json::Value>) -> Packet {
    Packet {
        ty: PacketType::Event,
        nsp: "/".into(),
        id: None,
        data: serde_json::Value::Array(args),
    }
}

#[must_use]
pub fn opts_for_rooms(rooms: &[&str]) -> BroadcastOptions {
    BroadcastOptions {
        rooms: rooms.iter().map(|r| Room::new(*r)).collect(),
        ..Default::default()
    }
}
