//! Channel name derivation for the channel-based Redis transport (§4.2.2).
//!
//! Three logical channels per namespace, all prefixed by a configurable
//! key (`"socket.io"` unless overridden):
//!
//! - `{key}#{nsp}#` -- pattern-subscribed; carries `BROADCAST` messages.
//!   `{key}#{nsp}#{room}#` is the per-room derivation used when a
//!   broadcast targets exactly one room.
//! - `{key}-request#{nsp}#` -- carries everything that expects (or may
//!   provoke) a cluster-wide reply, plus peer-liveness messages.
//! - `{key}-response#{nsp}#` -- carries responses. When
//!   `publish_on_specific_response_channel` is set, `DoPublishResponse`
//!   instead targets `{key}-response#{nsp}#{uid}#`.

use sio_protocol::{Room, ServerId};

#[must_use]
pub fn broadcast_channel(key: &str, nsp: &str) -> String {
    format!("{key}#{nsp}#")
}

#[must_use]
pub fn broadcast_pattern(key: &str, nsp: &str) -> String {
    format!("{key}#{nsp}#*")
}

#[must_use]
pub fn room_channel(key: &str, nsp: &str, room: &Room) -> String {
    format!("{key}#{nsp}#{}#", room.as_str())
}

#[must_use]
pub fn request_channel(key: &str, nsp: &str) -> String {
    format!("{key}-request#{nsp}#")
}

#[must_use]
pub fn response_channel(key: &str, nsp: &str) -> String {
    format!("{key}-response#{nsp}#")
}

#[must_use]
pub fn response_channel_for_uid(key: &str, nsp: &str, uid: &ServerId) -> String {
    format!("{key}-response#{nsp}#{}#", uid.as_str())
}

/// The single room a broadcast targets, if it targets exactly one.
/// Single-room broadcasts are published to the narrower room channel so
/// nodes with no sockets in that room never see the payload.
#[must_use]
pub fn single_target_room(rooms: &[Room]) -> Option<&Room> {
    match rooms {
        [room] => Some(room),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_channel_names() {
        assert_eq!(broadcast_channel("socket.io", "/"), "socket.io#/#");
        assert_eq!(room_channel("socket.io", "/", &Room::new("r1")), "socket.io#/#r1#");
        assert_eq!(request_channel("socket.io", "/"), "socket.io-request#/#");
        assert_eq!(response_channel("socket.io", "/"), "socket.io-response#/#");
        assert_eq!(response_channel_for_uid("socket.io", "/", &ServerId::new("u1")), "socket.io-response#/#u1#");
    }

    #[test]
    fn single_target_room_only_matches_exactly_one_room() {
        assert!(single_target_room(&[]).is_none());
        assert_eq!(single_target_room(&[Room::new("a")]), Some(&Room::new("a")));
        assert!(single_target_room(&[Room::new("a"), Room::new("b")]).is_none());
    }
}
