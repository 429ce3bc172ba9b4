//! `SessionAwareAdapter`: the in-process session-recovery wrapper (§4.3).
//!
//! Wraps an inner [`Adapter`] (normally a [`crate::local::LocalAdapter`]).
//! Every non-volatile, ack-less `EVENT` broadcast is stamped with an
//! ordered offset and appended to a ring-buffered log; a 60-second timer
//! evicts sessions and packets past `max_disconnection_duration`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use sio_protocol::{
    should_include_packet, BroadcastOptions, Offset, Packet, PacketType, PersistedPacket,
    PersistedSession, PrivateSessionId, RemoteSocketData, Room, Session, SessionToPersist,
    SocketId,
};
use tracing::debug;

use crate::adapter::Adapter;
use crate::error::AdapterError;
use crate::socket::SharedAck;

const GC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_DISCONNECTION_DURATION: Duration = Duration::from_millis(120_000);

pub struct SessionAwareAdapter {
    inner: Arc<dyn Adapter>,
    sessions: DashMap<PrivateSessionId, PersistedSession>,
    log: Mutex<VecDeque<PersistedPacket>>,
    max_disconnection_duration: Duration,
    seq: AtomicU64,
}

impl SessionAwareAdapter {
    #[must_use]
    pub fn new(inner: Arc<dyn Adapter>, max_disconnection_duration: Duration) -> Arc<Self> {
        let adapter = Arc::new(Self {
            inner,
            sessions: DashMap::new(),
            log: Mutex::new(VecDeque::new()),
            max_disconnection_duration,
            seq: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&adapter);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(GC_INTERVAL);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                let Some(adapter) = weak.upgrade() else {
                    return;
                };
                adapter.collect_garbage();
            }
        });
        adapter
    }

    fn next_offset(&self) -> Offset {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        Offset::from(format!("{millis}-{seq}"))
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    /// Drops sessions and log entries older than `max_disconnection_duration`.
    fn collect_garbage(&self) {
        let cutoff = Self::now_millis() - i64_from_duration(self.max_disconnection_duration);
        self.sessions.retain(|_, s| s.disconnected_at >= cutoff);
        let mut log = self.log.lock().unwrap();
        let before = log.len();
        log.retain(|p| p.emitted_at >= cutoff);
        if log.len() != before {
            debug!(dropped = before - log.len(), "pruned expired session log entries");
        }
    }

    /// Appends an offset to the trailing side-channel slot of an `EVENT`
    /// packet's data array, mirroring `withoutAcknowledgement`'s reconnect
    /// echo contract.
    fn stamp_and_log(&self, packet: &mut Packet, opts: &BroadcastOptions) -> Option<Offset> {
        let eligible = packet.ty == PacketType::Event
            && packet.id.is_none()
            && !opts.flags.volatile;
        if !eligible {
            return None;
        }
        let offset = self.next_offset();
        packet.push_data(serde_json::Value::String(offset.as_str().to_owned()));
        self.log.lock().unwrap().push_back(PersistedPacket {
            id: offset.clone(),
            emitted_at: Self::now_millis(),
            data: packet.data.clone(),
            opts: opts.clone(),
        });
        Some(offset)
    }
}

#[async_trait]
impl Adapter for SessionAwareAdapter {
    fn add_all(&self, id: SocketId, rooms: Vec<Room>) {
        self.inner.add_all(id, rooms);
    }

    fn del(&self, id: &SocketId, room: &Room) {
        self.inner.del(id, room);
    }

    fn del_all(&self, id: &SocketId) {
        self.inner.del_all(id);
    }

    async fn broadcast(&self, mut packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError> {
        self.stamp_and_log(&mut packet, &opts);
        self.inner.broadcast(packet, opts).await
    }

    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        client_count_cb: Box<dyn FnOnce(u64) + Send>,
        ack: SharedAck,
    ) -> Result<(), AdapterError> {
        // Packets with an ack id are never session-recovery candidates
        // (`withoutAcknowledgement := Id==nil`), so nothing is logged here.
        self.inner.broadcast_with_ack(packet, opts, client_count_cb, ack).await
    }

    fn sockets(&self, rooms: &[Room]) -> Vec<SocketId> {
        self.inner.sockets(rooms)
    }

    fn socket_rooms(&self, id: &SocketId) -> Option<Vec<Room>> {
        self.inner.socket_rooms(id)
    }

    async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<RemoteSocketData>, AdapterError> {
        self.inner.fetch_sockets(opts).await
    }

    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.inner.add_sockets(opts, rooms).await;
    }

    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.inner.del_sockets(opts, rooms).await;
    }

    async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) {
        self.inner.disconnect_sockets(opts, close).await;
    }

    async fn server_side_emit(&self, packets: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, AdapterError> {
        self.inner.server_side_emit(packets).await
    }

    fn persist_session(&self, session: SessionToPersist) {
        self.sessions.insert(
            session.pid.clone(),
            PersistedSession {
                sid: session.sid,
                pid: session.pid,
                rooms: session.rooms,
                data: session.data,
                disconnected_at: Self::now_millis(),
            },
        );
    }

    async fn restore_session(
        &self,
        pid: &sio_protocol::PrivateSessionId,
        offset: &Offset,
    ) -> Result<Option<Session>, AdapterError> {
        let Some(session) = self.sessions.get(pid).map(|s| s.clone()) else {
            return Ok(None);
        };
        let cutoff = Self::now_millis() - i64_from_duration(self.max_disconnection_duration);
        if session.disconnected_at < cutoff {
            return Ok(None);
        }

        let log = self.log.lock().unwrap();
        let Some(anchor) = log.iter().position(|p| &p.id == offset) else {
            return Ok(None);
        };

        let missed_packets = log
            .iter()
            .skip(anchor + 1)
            .filter(|p| should_include_packet(&session.rooms, &p.opts))
            .map(|p| p.data.clone())
            .collect();

        Ok(Some(Session {
            sid: session.sid,
            pid: session.pid,
            rooms: session.rooms,
            data: session.data,
            missed_packets,
        }))
    }

    fn server_count(&self) -> i64 {
        self.inner.server_count()
    }
}

fn i64_from_duration(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalAdapter;
    use crate::socket::{EncodedFrames, NamespaceSockets, PacketEncoder, Socket};
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct FakeEncoder;
    impl PacketEncoder for FakeEncoder {
        fn encode(&self, packet: &Packet, _binary: bool) -> EncodedFrames {
            Arc::new(vec![serde_json::to_vec(&packet.data).unwrap()])
        }
    }

    struct FakeNamespace {
        next_id: StdAtomicU64,
    }
    impl NamespaceSockets for FakeNamespace {
        fn name(&self) -> &str {
            "/"
        }
        fn get_socket(&self, _id: &SocketId) -> Option<Arc<dyn Socket>> {
            None
        }
        fn next_packet_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn event_packet() -> Packet {
        Packet {
            ty: PacketType::Event,
            nsp: "/".into(),
            id: None,
            data: serde_json::json!(["tick"]),
        }
    }

    fn new_adapter() -> Arc<SessionAwareAdapter> {
        let ns = Arc::new(FakeNamespace { next_id: StdAtomicU64::new(1) });
        let local: Arc<dyn Adapter> = Arc::new(LocalAdapter::new(ns, Arc::new(FakeEncoder)));
        SessionAwareAdapter::new(local, Duration::from_millis(120_000))
    }

    #[tokio::test]
    async fn scenario_6_stream_session_replay_semantics() {
        let adapter = new_adapter();

        let opts_r = BroadcastOptions { rooms: vec![Room::new("R")], ..Default::default() };
        let opts_s = BroadcastOptions { rooms: vec![Room::new("S")], ..Default::default() };

        adapter.broadcast(event_packet(), opts_r.clone()).await.unwrap();
        let offset_b1 = adapter.log.lock().unwrap().back().unwrap().id.clone();

        adapter.broadcast(event_packet(), opts_s).await.unwrap();
        adapter.broadcast(event_packet(), opts_r).await.unwrap();

        let pid = PrivateSessionId::new("p1");
        adapter.persist_session(SessionToPersist {
            sid: SocketId::new("s1"),
            pid: pid.clone(),
            rooms: vec![Room::new("R")],
            data: serde_json::Value::Null,
        });

        let session = adapter.restore_session(&pid, &offset_b1).await.unwrap().unwrap();
        assert_eq!(session.missed_packets.len(), 1, "only B3 should be replayed, B2 excluded");
    }

    #[tokio::test]
    async fn unknown_session_restores_to_none() {
        let adapter = new_adapter();
        let missing = PrivateSessionId::new("ghost");
        assert!(adapter.restore_session(&missing, &Offset::empty()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_session_restores_to_none() {
        let adapter = SessionAwareAdapter::new(
            {
                let ns = Arc::new(FakeNamespace { next_id: StdAtomicU64::new(1) });
                Arc::new(LocalAdapter::new(ns, Arc::new(FakeEncoder)))
            },
            Duration::from_millis(0),
        );
        let pid = PrivateSessionId::new("p1");
        adapter.persist_session(SessionToPersist {
            sid: SocketId::new("s1"),
            pid: pid.clone(),
            rooms: vec![],
            data: serde_json::Value::Null,
        });
        assert!(adapter.restore_session(&pid, &Offset::empty()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_packets_are_never_logged() {
        let adapter = new_adapter();
        let mut packet = event_packet();
        packet.id = Some(1);
        adapter
            .broadcast_with_ack(packet, BroadcastOptions::default(), Box::new(|_| {}), Arc::new(|_, _| {}))
            .await
            .unwrap();
        assert!(adapter.log.lock().unwrap().is_empty());
    }
}
