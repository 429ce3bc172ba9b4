//! `HeartbeatClusterAdapter`: `ClusterAdapter` plus explicit peer liveness
//! tracking (§4.2.1). A dead peer is swept out of every open request's
//! `MissingUids` set so the request can still resolve successfully.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sio_core::{Adapter, AdapterError, SharedAck};
use sio_protocol::{
    BroadcastOptions, ClusterMessage, MessageBody, Offset, Packet, PrivateSessionId,
    RemoteSocketData, Room, ServerId, Session, SessionToPersist, SocketId,
};
use tracing::{debug, info_span, Instrument};

use crate::base::{ClusterAdapter, PeerSource, ServerSideEmitHandler, DEFAULT_REQUEST_TIMEOUT};
use crate::bus::Bus;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(10_000);

pub struct HeartbeatClusterAdapter {
    base: Arc<ClusterAdapter>,
    nodes: Arc<DashMap<ServerId, Instant>>,
    heartbeat_timeout: Duration,
    weak_self: Weak<Self>,
}

impl HeartbeatClusterAdapter {
    #[must_use]
    pub fn new(uid: ServerId, nsp: impl Into<String>, inner: Arc<dyn Adapter>, bus: Arc<dyn Bus>) -> Arc<Self> {
        Self::with_options(
            uid,
            nsp,
            inner,
            bus,
            DEFAULT_HEARTBEAT_INTERVAL,
            DEFAULT_HEARTBEAT_TIMEOUT,
            DEFAULT_REQUEST_TIMEOUT,
            None,
        )
    }

    #[must_use]
    pub fn with_options(
        uid: ServerId,
        nsp: impl Into<String>,
        inner: Arc<dyn Adapter>,
        bus: Arc<dyn Bus>,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        request_timeout: Duration,
        server_side_emit_handler: Option<ServerSideEmitHandler>,
    ) -> Arc<Self> {
        let nsp = nsp.into();
        let nodes: Arc<DashMap<ServerId, Instant>> = Arc::new(DashMap::new());
        let base = ClusterAdapter::with_options(
            uid.clone(),
            nsp.clone(),
            inner,
            bus.clone(),
            PeerSource::Heartbeat(nodes.clone()),
            request_timeout,
            server_side_emit_handler,
        );

        let adapter = Arc::new_cyclic(|weak_self| Self {
            base,
            nodes,
            heartbeat_timeout,
            weak_self: weak_self.clone(),
        });

        {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                let msg = ClusterMessage::new(adapter.base.uid.clone(), adapter.base.nsp.clone(), MessageBody::InitialHeartbeat);
                let _ = adapter.base.bus.do_publish(msg).await;
            });
        }

        {
            let weak = adapter.weak_self.clone();
            let span = info_span!("heartbeat_loop", uid = %uid, nsp = %nsp);
            tokio::spawn(
                async move {
                    let mut tick = tokio::time::interval(heartbeat_interval);
                    loop {
                        tick.tick().await;
                        let Some(adapter) = weak.upgrade() else {
                            return;
                        };
                        let msg = ClusterMessage::new(adapter.base.uid.clone(), adapter.base.nsp.clone(), MessageBody::Heartbeat);
                        let _ = adapter.base.bus.do_publish(msg).await;
                    }
                }
                .instrument(span),
            );
        }

        {
            let weak = adapter.weak_self.clone();
            let sweep_interval = heartbeat_timeout / 2;
            let span = info_span!("heartbeat_sweep_loop", uid = %uid, nsp = %nsp);
            tokio::spawn(
                async move {
                    let mut tick = tokio::time::interval(sweep_interval.max(Duration::from_millis(50)));
                    loop {
                        tick.tick().await;
                        let Some(adapter) = weak.upgrade() else {
                            return;
                        };
                        adapter.sweep_dead_peers();
                    }
                }
                .instrument(span),
            );
        }

        adapter
    }

    fn record_peer(&self, peer: ServerId) {
        self.nodes.insert(peer, Instant::now());
    }

    fn sweep_dead_peers(&self) {
        let dead: Vec<ServerId> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().elapsed() > self.heartbeat_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for peer in dead {
            debug!(uid = %self.base.uid, nsp = %self.base.nsp, peer = %peer, "evicting peer, no heartbeat within timeout");
            self.nodes.remove(&peer);
            self.base.forget_peer(&peer);
        }
    }

    /// Entry point for messages off the bus. Heartbeat bookkeeping is
    /// handled here; everything else is forwarded to the base adapter.
    pub async fn on_message(&self, msg: ClusterMessage) {
        if msg.uid == self.base.uid {
            return;
        }
        match &msg.body {
            MessageBody::InitialHeartbeat | MessageBody::Heartbeat => {
                self.record_peer(msg.uid.clone());
                return;
            }
            MessageBody::AdapterClose => {
                self.nodes.remove(&msg.uid);
                self.base.forget_peer(&msg.uid);
                return;
            }
            _ => {}
        }
        self.base.on_message(msg).await;
    }

    pub async fn close(&self) {
        let msg = ClusterMessage::new(self.base.uid.clone(), self.base.nsp.clone(), MessageBody::AdapterClose);
        let _ = self.base.bus.do_publish(msg).await;
    }
}

#[async_trait]
impl Adapter for HeartbeatClusterAdapter {
    fn add_all(&self, id: SocketId, rooms: Vec<Room>) {
        self.base.add_all(id, rooms);
    }

    fn del(&self, id: &SocketId, room: &Room) {
        self.base.del(id, room);
    }

    fn del_all(&self, id: &SocketId) {
        self.base.del_all(id);
    }

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError> {
        self.base.broadcast(packet, opts).await
    }

    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        client_count_cb: Box<dyn FnOnce(u64) + Send>,
        ack: SharedAck,
    ) -> Result<(), AdapterError> {
        self.base.broadcast_with_ack(packet, opts, client_count_cb, ack).await
    }

    fn sockets(&self, rooms: &[Room]) -> Vec<SocketId> {
        self.base.sockets(rooms)
    }

    fn socket_rooms(&self, id: &SocketId) -> Option<Vec<Room>> {
        self.base.socket_rooms(id)
    }

    async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<RemoteSocketData>, AdapterError> {
        self.base.fetch_sockets(opts).await
    }

    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.base.add_sockets(opts, rooms).await;
    }

    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.base.del_sockets(opts, rooms).await;
    }

    async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) {
        self.base.disconnect_sockets(opts, close).await;
    }

    async fn server_side_emit(&self, packets: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, AdapterError> {
        self.base.server_side_emit(packets).await
    }

    fn persist_session(&self, session: SessionToPersist) {
        self.base.persist_session(session);
    }

    async fn restore_session(&self, pid: &PrivateSessionId, offset: &Offset) -> Result<Option<Session>, AdapterError> {
        self.base.restore_session(pid, offset).await
    }

    fn server_count(&self) -> i64 {
        self.base.server_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use sio_core::{EncodedFrames, LocalAdapter, NamespaceSockets, PacketEncoder, Socket};

    struct EmptyNamespace;

    impl NamespaceSockets for EmptyNamespace {
        fn name(&self) -> &str {
            "/"
        }

        fn get_socket(&self, _id: &SocketId) -> Option<Arc<dyn Socket>> {
            None
        }

        fn next_packet_id(&self) -> u64 {
            0
        }
    }

    struct NullEncoder;

    impl PacketEncoder for NullEncoder {
        fn encode(&self, _packet: &Packet, _binary: bool) -> EncodedFrames {
            Arc::new(Vec::new())
        }
    }

    fn empty_local_adapter() -> Arc<LocalAdapter> {
        Arc::new(LocalAdapter::new(Arc::new(EmptyNamespace), Arc::new(NullEncoder)))
    }

    /// Delivers every published message straight to every other registered
    /// adapter's `on_message`, synchronously, via a fan-out list. Good
    /// enough to exercise the protocol logic without a real transport.
    struct FakeBus {
        peers: StdMutex<Vec<Arc<HeartbeatClusterAdapter>>>,
        drop_uid: StdMutex<Option<ServerId>>,
    }

    impl FakeBus {
        fn new() -> Arc<Self> {
            Arc::new(Self { peers: StdMutex::new(Vec::new()), drop_uid: StdMutex::new(None) })
        }

        fn register(&self, peer: Arc<HeartbeatClusterAdapter>) {
            self.peers.lock().unwrap().push(peer);
        }

        /// Simulates one peer going silent: messages it would have
        /// published are swallowed instead of fanned out.
        fn silence(&self, uid: ServerId) {
            *self.drop_uid.lock().unwrap() = Some(uid);
        }
    }

    #[async_trait]
    impl Bus for FakeBus {
        async fn do_publish(&self, msg: ClusterMessage) -> Result<Offset, crate::error::ClusterError> {
            if self.drop_uid.lock().unwrap().as_ref() == Some(&msg.uid) {
                return Ok(Offset::empty());
            }
            let peers = self.peers.lock().unwrap().clone();
            for peer in peers {
                peer.on_message(msg.clone()).await;
            }
            Ok(Offset::empty())
        }

        async fn do_publish_response(&self, requester_uid: ServerId, resp: ClusterMessage) -> Result<(), crate::error::ClusterError> {
            let peers = self.peers.lock().unwrap().clone();
            for peer in peers {
                if peer.base.uid == requester_uid {
                    peer.on_message(resp.clone()).await;
                }
            }
            Ok(())
        }

        async fn server_count(&self) -> i64 {
            i64::try_from(self.peers.lock().unwrap().len()).unwrap_or(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_5_heartbeat_eviction_completes_pending_request() {
        let bus = FakeBus::new();
        let ua = HeartbeatClusterAdapter::with_options(
            ServerId::new("UA"),
            "/",
            empty_local_adapter(),
            bus.clone(),
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(500),
            None,
        );
        let ub = HeartbeatClusterAdapter::with_options(
            ServerId::new("UB"),
            "/",
            empty_local_adapter(),
            bus.clone(),
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(500),
            None,
        );
        let uc = HeartbeatClusterAdapter::with_options(
            ServerId::new("UC"),
            "/",
            empty_local_adapter(),
            bus.clone(),
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(500),
            None,
        );
        bus.register(ua.clone());
        bus.register(ub.clone());
        bus.register(uc.clone());

        // let initial heartbeats land so every adapter learns about its peers
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(ua.server_count(), 3);

        // UC goes silent (no more heartbeats answered); UB keeps responding
        bus.silence(ServerId::new("UC"));

        let opts = BroadcastOptions::default();
        let fetch = tokio::spawn({
            let ua = ua.clone();
            async move { ua.fetch_sockets(opts).await }
        });

        // advance past heartbeat_timeout so UA's sweep evicts UC
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        let result = fetch.await.unwrap();
        assert!(result.is_ok(), "request should resolve once UC is declared dead, got {result:?}");
    }

    #[tokio::test]
    async fn adapter_close_forgets_the_peer_immediately() {
        let bus = FakeBus::new();
        let ua = HeartbeatClusterAdapter::with_options(
            ServerId::new("UA"),
            "/",
            empty_local_adapter(),
            bus.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_millis(200),
            None,
        );
        bus.register(ua.clone());

        let close_msg = ClusterMessage::new(ServerId::new("UB"), "/", MessageBody::InitialHeartbeat);
        ua.on_message(close_msg).await;
        assert_eq!(ua.nodes.len(), 1);

        let close_msg = ClusterMessage::new(ServerId::new("UB"), "/", MessageBody::AdapterClose);
        ua.on_message(close_msg).await;
        assert_eq!(ua.nodes.len(), 0);
    }
}
