//! Session-recovery data model shared by the in-process and stream-backed
//! session stores.

use serde::{Deserialize, Serialize};

use crate::ids::{Offset, PrivateSessionId, Room, SocketId};
use crate::options::BroadcastOptions;

/// What a socket hands the adapter when it disconnects, to be persisted
/// until `max_disconnection_duration` elapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionToPersist {
    pub sid: SocketId,
    pub pid: PrivateSessionId,
    pub rooms: Vec<Room>,
    pub data: serde_json::Value,
}

/// The persisted record, timestamped at the moment of disconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub sid: SocketId,
    pub pid: PrivateSessionId,
    pub rooms: Vec<Room>,
    pub data: serde_json::Value,
    pub disconnected_at: i64,
}

/// A session restored on reconnect, carrying the packets the client missed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sid: SocketId,
    pub pid: PrivateSessionId,
    pub rooms: Vec<Room>,
    pub data: serde_json::Value,
    pub missed_packets: Vec<serde_json::Value>,
}

/// One entry of the broadcast packet log kept for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPacket {
    pub id: Offset,
    pub emitted_at: i64,
    pub data: serde_json::Value,
    pub opts: BroadcastOptions,
}

/// `shouldIncludePacket`: pure, idempotent membership test used by every
/// session-store implementation to decide whether a logged packet belongs
/// in a given session's `missed_packets`.
///
/// `included := opts.rooms is empty OR some room in opts.rooms is in session_rooms`
/// `not_excluded := no room in opts.except is in session_rooms`
/// returns `included AND not_excluded` -- exclusion always wins over inclusion.
#[must_use]
pub fn should_include_packet(session_rooms: &[Room], opts: &BroadcastOptions) -> bool {
    let included = opts.rooms.is_empty() || opts.rooms.iter().any(|r| session_rooms.contains(r));
    let not_excluded = !opts.except.iter().any(|r| session_rooms.contains(r));
    included && not_excluded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooms(names: &[&str]) -> Vec<Room> {
        names.iter().map(|n| Room::new(*n)).collect()
    }

    #[test]
    fn empty_target_rooms_means_included_by_default() {
        let opts = BroadcastOptions::default();
        assert!(should_include_packet(&rooms(&["a"]), &opts));
        assert!(should_include_packet(&[], &opts));
    }

    #[test]
    fn membership_requires_overlap_with_target_rooms() {
        let mut opts = BroadcastOptions::default();
        opts.rooms = rooms(&["a", "b"]);
        assert!(should_include_packet(&rooms(&["b"]), &opts));
        assert!(!should_include_packet(&rooms(&["c"]), &opts));
    }

    #[test]
    fn exclusion_overrides_inclusion() {
        let mut opts = BroadcastOptions::default();
        opts.rooms = rooms(&["a"]);
        opts.except = rooms(&["a"]);
        assert!(!should_include_packet(&rooms(&["a"]), &opts));
    }
}
