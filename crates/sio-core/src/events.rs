//! Room-transition events the adapter fires on the exact transitions
//! described in §3 ("events `create-room`, `join-room`, `leave-room`,
//! `delete-room` fire on the exact transitions"). Broadcast over a
//! `tokio::sync::broadcast` channel the same way the teacher's
//! `AppState::dashboard_tx` fans UI events out to any number of
//! subscribers (dynamic-channel sharded adapters subscribe here to know
//! when to (un)subscribe a per-room pub/sub shard).

use sio_protocol::{Room, SocketId};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    CreateRoom(Room),
    JoinRoom(Room, SocketId),
    LeaveRoom(Room, SocketId),
    DeleteRoom(Room),
}

/// Lagging subscribers silently drop the oldest events rather than block
/// the broadcast path; a capacity of 1024 comfortably outpaces normal
/// room churn.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<AdapterEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventSink {
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        // No receivers is the common case (no dynamic-channel listeners
        // attached); a send error there is expected, not a fault.
        let _ = self.tx.send(event);
    }
}
