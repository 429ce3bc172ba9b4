//! `LocalAdapter`: the in-process room/sid index and broadcast engine
//! (§4.1). Every cluster adapter wraps exactly one of these.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use sio_protocol::{
    BroadcastOptions, Offset, Packet, PrivateSessionId, RemoteSocketData, Room, Session,
    SessionToPersist, SocketId,
};
use tokio::sync::broadcast;

use crate::adapter::Adapter;
use crate::error::AdapterError;
use crate::events::{AdapterEvent, EventSink};
use crate::socket::{NamespaceSockets, PacketEncoder, SharedAck, WriteOptions};

pub struct LocalAdapter {
    rooms: DashMap<Room, DashSet<SocketId>>,
    sids: DashMap<SocketId, DashSet<Room>>,
    namespace: Arc<dyn NamespaceSockets>,
    encoder: Arc<dyn PacketEncoder>,
    events: EventSink,
}

impl LocalAdapter {
    #[must_use]
    pub fn new(namespace: Arc<dyn NamespaceSockets>, encoder: Arc<dyn PacketEncoder>) -> Self {
        Self {
            rooms: DashMap::new(),
            sids: DashMap::new(),
            namespace,
            encoder,
            events: EventSink::default(),
        }
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    /// Resolves `opts` to the deduplicated target socket set, per §4.1's
    /// `apply`: union the except-rooms, then either walk the requested
    /// rooms in order (deduping as we go) or every socket if none were
    /// requested.
    #[must_use]
    pub fn apply(&self, opts: &BroadcastOptions) -> Vec<SocketId> {
        let except: HashSet<SocketId> = opts
            .except
            .iter()
            .filter_map(|r| self.rooms.get(r))
            .flat_map(|set| set.iter().map(|s| s.clone()).collect::<Vec<_>>())
            .collect();

        let mut seen = HashSet::new();
        let mut result = Vec::new();

        if opts.rooms.is_empty() {
            for entry in &self.sids {
                let sid = entry.key();
                if !except.contains(sid) && seen.insert(sid.clone()) {
                    result.push(sid.clone());
                }
            }
        } else {
            for room in &opts.rooms {
                let Some(set) = self.rooms.get(room) else {
                    continue;
                };
                for sid in set.iter() {
                    if !except.contains(&*sid) && seen.insert(sid.clone()) {
                        result.push(sid.clone());
                    }
                }
            }
        }
        result
    }

    fn write_options(opts: &BroadcastOptions) -> WriteOptions {
        WriteOptions {
            volatile: opts.flags.volatile,
            compress: opts.flags.compress,
            pre_encoded: true,
        }
    }

    fn fan_out(&self, packet: &Packet, opts: &BroadcastOptions, targets: &[SocketId]) {
        let frames = self.encoder.encode(packet, opts.flags.binary);
        let write_opts = Self::write_options(opts);
        for sid in targets {
            let Some(socket) = self.namespace.get_socket(sid) else {
                // Mid-teardown; silently skip per §4.1.
                continue;
            };
            socket.notify_outgoing_listeners(packet);
            socket.write_to_engine(frames.clone(), write_opts);
        }
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn add_all(&self, id: SocketId, rooms: Vec<Room>) {
        for room in rooms {
            let created;
            let set = match self.rooms.entry(room.clone()) {
                Entry::Occupied(o) => {
                    created = false;
                    o.into_ref()
                }
                Entry::Vacant(v) => {
                    created = true;
                    v.insert(DashSet::new())
                }
            };
            let joined = set.insert(id.clone());
            drop(set);
            if created {
                self.events.emit(AdapterEvent::CreateRoom(room.clone()));
            }
            if joined {
                self.events.emit(AdapterEvent::JoinRoom(room.clone(), id.clone()));
            }
            self.sids.entry(id.clone()).or_insert_with(DashSet::new).insert(room);
        }
    }

    fn del(&self, id: &SocketId, room: &Room) {
        let mut became_empty = false;
        if let Some(set) = self.rooms.get(room) {
            let removed = set.remove(id).is_some();
            became_empty = set.is_empty();
            drop(set);
            if removed {
                self.events.emit(AdapterEvent::LeaveRoom(room.clone(), id.clone()));
            }
        }
        if became_empty {
            self.rooms.remove(room);
            self.events.emit(AdapterEvent::DeleteRoom(room.clone()));
        }
        if let Some(rooms) = self.sids.get(id) {
            rooms.remove(room);
        }
    }

    fn del_all(&self, id: &SocketId) {
        let Some((_, rooms)) = self.sids.remove(id) else {
            return;
        };
        for room in rooms.iter() {
            let room = room.clone();
            if let Some(set) = self.rooms.get(&room) {
                let removed = set.remove(id).is_some();
                let became_empty = set.is_empty();
                drop(set);
                if removed {
                    self.events.emit(AdapterEvent::LeaveRoom(room.clone(), id.clone()));
                }
                if became_empty {
                    self.rooms.remove(&room);
                    self.events.emit(AdapterEvent::DeleteRoom(room));
                }
            }
        }
    }

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError> {
        let targets = self.apply(&opts);
        self.fan_out(&packet, &opts, &targets);
        Ok(())
    }

    async fn broadcast_with_ack(
        &self,
        mut packet: Packet,
        opts: BroadcastOptions,
        client_count_cb: Box<dyn FnOnce(u64) + Send>,
        ack: SharedAck,
    ) -> Result<(), AdapterError> {
        let packet_id = self.namespace.next_packet_id();
        packet.id = Some(packet_id);

        let targets = self.apply(&opts);
        let frames = self.encoder.encode(&packet, opts.flags.binary);
        let write_opts = Self::write_options(&opts);
        let client_count = AtomicU64::new(0);

        for sid in &targets {
            let Some(socket) = self.namespace.get_socket(sid) else {
                continue;
            };
            client_count.fetch_add(1, Ordering::SeqCst);
            let ack_for_client = ack.clone();
            socket.register_ack(
                packet_id,
                Box::new(move |args, err| ack_for_client(args, err)),
            );
            socket.notify_outgoing_listeners(&packet);
            socket.write_to_engine(frames.clone(), write_opts);
        }

        client_count_cb(client_count.load(Ordering::SeqCst));
        Ok(())
    }

    fn sockets(&self, rooms: &[Room]) -> Vec<SocketId> {
        let opts = BroadcastOptions {
            rooms: rooms.to_vec(),
            ..Default::default()
        };
        self.apply(&opts)
    }

    fn socket_rooms(&self, id: &SocketId) -> Option<Vec<Room>> {
        self.sids.get(id).map(|set| set.iter().map(|r| r.clone()).collect())
    }

    async fn fetch_sockets(
        &self,
        opts: BroadcastOptions,
    ) -> Result<Vec<RemoteSocketData>, AdapterError> {
        let targets = self.apply(&opts);
        let mut out = Vec::with_capacity(targets.len());
        for sid in targets {
            let Some(socket) = self.namespace.get_socket(&sid) else {
                continue;
            };
            out.push(RemoteSocketData {
                id: sid,
                handshake: serde_json::to_value(socket.handshake()).unwrap_or(serde_json::Value::Null),
                rooms: self
                    .socket_rooms(socket.id())
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| r.0)
                    .collect(),
                data: socket.data(),
            });
        }
        Ok(out)
    }

    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        for sid in self.apply(&opts) {
            self.add_all(sid, rooms.clone());
        }
    }

    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        for sid in self.apply(&opts) {
            for room in &rooms {
                self.del(&sid, room);
            }
        }
    }

    async fn disconnect_sockets(&self, opts: BroadcastOptions, _close: bool) {
        // Actually tearing down the transport connection is out of scope;
        // the adapter's contribution is resolving who's targeted and
        // dropping them from the room index.
        for sid in self.apply(&opts) {
            self.del_all(&sid);
        }
    }

    async fn server_side_emit(
        &self,
        _packets: Vec<serde_json::Value>,
    ) -> Result<Vec<serde_json::Value>, AdapterError> {
        Err(AdapterError::Unsupported("ServerSideEmit requires a ClusterAdapter"))
    }

    fn persist_session(&self, _session: SessionToPersist) {
        // No-op: there's only one process, nothing to recover from.
    }

    async fn restore_session(
        &self,
        _pid: &PrivateSessionId,
        _offset: &Offset,
    ) -> Result<Option<Session>, AdapterError> {
        Ok(None)
    }

    fn server_count(&self) -> i64 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{AckFn, EncodedFrames, Handshake, Socket};
    use dashmap::DashMap as StdDashMap;
    use std::sync::Mutex;

    struct FakeEncoder;
    impl PacketEncoder for FakeEncoder {
        fn encode(&self, packet: &Packet, _binary: bool) -> EncodedFrames {
            Arc::new(vec![serde_json::to_vec(&packet.data).unwrap()])
        }
    }

    struct FakeSocket {
        id: SocketId,
        handshake: Handshake,
        received: Mutex<Vec<Vec<u8>>>,
        acks: StdDashMap<u64, ()>,
    }

    impl Socket for FakeSocket {
        fn id(&self) -> &SocketId {
            &self.id
        }
        fn handshake(&self) -> &Handshake {
            &self.handshake
        }
        fn data(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn write_to_engine(&self, frames: EncodedFrames, _opts: WriteOptions) {
            let mut received = self.received.lock().unwrap();
            received.extend(frames.iter().cloned());
        }
        fn register_ack(&self, packet_id: u64, _ack: AckFn) {
            self.acks.insert(packet_id, ());
        }
        fn notify_outgoing_listeners(&self, _packet: &Packet) {}
    }

    struct FakeNamespace {
        sockets: DashMap<SocketId, Arc<FakeSocket>>,
        next_id: AtomicU64,
    }

    impl FakeNamespace {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sockets: DashMap::new(),
                next_id: AtomicU64::new(1),
            })
        }

        fn add(&self, id: &str) -> Arc<FakeSocket> {
            let socket = Arc::new(FakeSocket {
                id: SocketId::new(id),
                handshake: Handshake::default(),
                received: Mutex::new(Vec::new()),
                acks: StdDashMap::new(),
            });
            self.sockets.insert(SocketId::new(id), socket.clone());
            socket
        }
    }

    impl NamespaceSockets for FakeNamespace {
        fn name(&self) -> &str {
            "/"
        }
        fn get_socket(&self, id: &SocketId) -> Option<Arc<dyn Socket>> {
            self.sockets.get(id).map(|s| s.clone() as Arc<dyn Socket>)
        }
        fn next_packet_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn event_packet() -> Packet {
        Packet {
            ty: sio_protocol::PacketType::Event,
            nsp: "/".into(),
            id: None,
            data: serde_json::json!(["hello"]),
        }
    }

    #[tokio::test]
    async fn scenario_1_room_fan_out_and_except() {
        let ns = FakeNamespace::new();
        let s1 = ns.add("s1");
        let s2 = ns.add("s2");
        let adapter = LocalAdapter::new(ns.clone(), Arc::new(FakeEncoder));

        adapter.add_all(s1.id.clone(), vec![Room::new("R")]);
        adapter.add_all(s2.id.clone(), vec![Room::new("R")]);

        let opts = BroadcastOptions { rooms: vec![Room::new("R")], ..Default::default() };
        adapter.broadcast(event_packet(), opts).await.unwrap();

        assert_eq!(s1.received.lock().unwrap().len(), 1);
        assert_eq!(s2.received.lock().unwrap().len(), 1);

        let except_opts = BroadcastOptions {
            rooms: vec![Room::new("R")],
            except: vec![Room::new("R")],
            ..Default::default()
        };
        adapter.broadcast(event_packet(), except_opts).await.unwrap();
        assert_eq!(s1.received.lock().unwrap().len(), 1, "except should suppress delivery");
        assert_eq!(s2.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scenario_2_dedup_across_multiple_target_rooms() {
        let ns = FakeNamespace::new();
        let s1 = ns.add("s1");
        let adapter = LocalAdapter::new(ns.clone(), Arc::new(FakeEncoder));

        adapter.add_all(s1.id.clone(), vec![Room::new("A"), Room::new("B")]);

        let opts = BroadcastOptions {
            rooms: vec![Room::new("A"), Room::new("B")],
            ..Default::default()
        };
        adapter.broadcast(event_packet(), opts).await.unwrap();
        assert_eq!(s1.received.lock().unwrap().len(), 1, "must not double-deliver");
    }

    #[tokio::test]
    async fn invariant_room_sid_bimap_stays_consistent() {
        let ns = FakeNamespace::new();
        let s1 = ns.add("s1");
        let adapter = LocalAdapter::new(ns.clone(), Arc::new(FakeEncoder));

        adapter.add_all(s1.id.clone(), vec![Room::new("A")]);
        assert!(adapter.socket_rooms(&s1.id).unwrap().contains(&Room::new("A")));
        assert!(adapter.sockets(&[Room::new("A")]).contains(&s1.id));

        adapter.del_all(&s1.id);
        assert!(adapter.socket_rooms(&s1.id).is_none());
        assert!(adapter.rooms.is_empty(), "empty room entries must be deleted");
    }

    #[tokio::test]
    async fn broadcast_with_ack_counts_clients_and_registers_acks() {
        let ns = FakeNamespace::new();
        let s1 = ns.add("s1");
        let s2 = ns.add("s2");
        let adapter = LocalAdapter::new(ns.clone(), Arc::new(FakeEncoder));
        adapter.add_all(s1.id.clone(), vec![Room::new("R")]);
        adapter.add_all(s2.id.clone(), vec![Room::new("R")]);

        let count = Arc::new(Mutex::new(None));
        let count_cb_slot = count.clone();
        let ack_calls = Arc::new(Mutex::new(0u32));
        let ack_calls_clone = ack_calls.clone();

        let opts = BroadcastOptions { rooms: vec![Room::new("R")], ..Default::default() };
        adapter
            .broadcast_with_ack(
                event_packet(),
                opts,
                Box::new(move |n| *count_cb_slot.lock().unwrap() = Some(n)),
                Arc::new(move |_args, _err| {
                    *ack_calls_clone.lock().unwrap() += 1;
                }),
            )
            .await
            .unwrap();

        assert_eq!(*count.lock().unwrap(), Some(2));
        assert_eq!(s1.acks.len(), 1);
        assert_eq!(s2.acks.len(), 1);
        assert_eq!(*ack_calls.lock().unwrap(), 0, "ack only fires when a client replies");
    }

    #[test]
    fn server_count_is_always_one() {
        let ns = FakeNamespace::new();
        let adapter = LocalAdapter::new(ns, Arc::new(FakeEncoder));
        assert_eq!(adapter.server_count(), 1);
    }

    #[tokio::test]
    async fn server_side_emit_is_unsupported() {
        let ns = FakeNamespace::new();
        let adapter = LocalAdapter::new(ns, Arc::new(FakeEncoder));
        let err = adapter.server_side_emit(vec![]).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unsupported(_)));
    }
}
