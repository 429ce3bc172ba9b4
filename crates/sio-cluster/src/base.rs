//! `ClusterAdapter`: wraps one `LocalAdapter` (or `SessionAwareAdapter`)
//! plus a bus, intercepting every operation to decide whether it needs to
//! publish (§4.2).

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sio_core::{Adapter, AdapterError, SharedAck};
use sio_protocol::{
    BroadcastAckData, BroadcastClientCountData, BroadcastData, BroadcastOptions,
    DisconnectSocketsData, FetchSocketsData, FetchSocketsResponseData, MessageBody, Offset,
    Packet, PrivateSessionId, RemoteSocketData, RequestId, Room, RoomsData, Session,
    ServerId, ServerSideEmitData, ServerSideEmitResponseData, SessionToPersist, SocketId,
};
use sio_protocol::ClusterMessage;
use tracing::{debug, instrument, warn, Span};
use uuid::Uuid;

use crate::bus::Bus;
use crate::pending::{AckRequestEntry, CollectedResponses, Completion, PendingRequest};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Where `ClusterAdapter` gets the peer count/identity it waits on for a
/// multi-response request. Plain channel adapters have nothing but
/// `Bus::server_count`; `HeartbeatClusterAdapter` supplies its own live
/// peer set instead (§4.2.1).
pub enum PeerSource {
    Bus,
    Heartbeat(Arc<DashMap<ServerId, Instant>>),
}

/// Callback invoked when a `SERVER_SIDE_EMIT` arrives from a peer; stands
/// in for "the namespace's server-side-emit handler" (§4.2, out of scope
/// here). `None` means this node answers with an empty packet slice.
pub type ServerSideEmitHandler = Arc<dyn Fn(Vec<serde_json::Value>) -> Vec<serde_json::Value> + Send + Sync>;

pub struct ClusterAdapter {
    pub(crate) uid: ServerId,
    pub(crate) nsp: String,
    pub(crate) inner: Arc<dyn Adapter>,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) peer_source: PeerSource,
    pub(crate) requests: DashMap<RequestId, Arc<PendingRequest>>,
    pub(crate) ack_requests: DashMap<RequestId, Arc<AckRequestEntry>>,
    pub(crate) request_timeout: Duration,
    pub(crate) server_side_emit_handler: Option<ServerSideEmitHandler>,
    server_count_cache: AtomicI64,
    weak_self: Weak<Self>,
}

impl ClusterAdapter {
    #[must_use]
    pub fn new(uid: ServerId, nsp: impl Into<String>, inner: Arc<dyn Adapter>, bus: Arc<dyn Bus>) -> Arc<Self> {
        Self::with_options(uid, nsp, inner, bus, PeerSource::Bus, DEFAULT_REQUEST_TIMEOUT, None)
    }

    #[must_use]
    pub fn with_options(
        uid: ServerId,
        nsp: impl Into<String>,
        inner: Arc<dyn Adapter>,
        bus: Arc<dyn Bus>,
        peer_source: PeerSource,
        request_timeout: Duration,
        server_side_emit_handler: Option<ServerSideEmitHandler>,
    ) -> Arc<Self> {
        let adapter = Arc::new_cyclic(|weak_self| Self {
            uid,
            nsp: nsp.into(),
            inner,
            bus: bus.clone(),
            peer_source,
            requests: DashMap::new(),
            ack_requests: DashMap::new(),
            request_timeout,
            server_side_emit_handler,
            server_count_cache: AtomicI64::new(1),
            weak_self: weak_self.clone(),
        });

        if matches!(adapter.peer_source, PeerSource::Bus) {
            let weak = Arc::downgrade(&adapter);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(10));
                loop {
                    tick.tick().await;
                    let Some(adapter) = weak.upgrade() else {
                        return;
                    };
                    let count = adapter.bus.server_count().await;
                    adapter.server_count_cache.store(count, Ordering::Relaxed);
                }
            });
        }

        adapter
    }

    fn new_completion(&self, expected_minus_one: i64) -> Completion {
        match &self.peer_source {
            PeerSource::Bus => Completion::by_count(expected_minus_one),
            PeerSource::Heartbeat(nodes) => {
                let peers: HashSet<ServerId> = nodes.iter().map(|e| e.key().clone()).collect();
                Completion::by_known_peers(peers)
            }
        }
    }

    pub(crate) fn forget_peer(&self, peer: &ServerId) {
        for entry in &self.requests {
            entry.value().completion.forget_peer(peer);
            entry.value().notify.notify_waiters();
        }
    }

    fn new_request_id() -> RequestId {
        RequestId::new(Uuid::new_v4().to_string())
    }

    /// Entry point for messages arriving off the bus. Self-published
    /// messages are dropped per invariant 4; everything else dispatches
    /// by tag.
    pub async fn on_message(&self, msg: ClusterMessage) {
        if msg.uid == self.uid {
            return;
        }
        let from = msg.uid.clone();
        match msg.body {
            MessageBody::InitialHeartbeat | MessageBody::Heartbeat | MessageBody::AdapterClose => {
                // Peer bookkeeping belongs to whichever wrapper tracks
                // liveness; the plain base adapter has nothing to do here.
            }
            MessageBody::Broadcast(data) => self.on_broadcast(from, data).await,
            MessageBody::SocketsJoin(data) => self.on_sockets_join(data).await,
            MessageBody::SocketsLeave(data) => self.on_sockets_leave(data).await,
            MessageBody::DisconnectSockets(data) => self.on_disconnect_sockets(data).await,
            MessageBody::FetchSockets(data) => self.on_fetch_sockets_request(from, data).await,
            MessageBody::FetchSocketsResponse(data) => self.on_fetch_sockets_response(&from, data),
            MessageBody::ServerSideEmit(data) => self.on_server_side_emit_request(from, data).await,
            MessageBody::ServerSideEmitResponse(data) => self.on_server_side_emit_response(&from, data),
            MessageBody::BroadcastClientCount(data) => self.on_broadcast_client_count(data),
            MessageBody::BroadcastAck(data) => self.on_broadcast_ack(data),
        }
    }

    async fn on_broadcast(&self, from: ServerId, data: BroadcastData) {
        let BroadcastData { opts, packet, request_id } = data;
        let Some(request_id) = request_id else {
            let _ = self.inner.broadcast(packet, opts).await;
            return;
        };
        let uid = self.uid.clone();
        let nsp = self.nsp.clone();
        let bus = self.bus.clone();
        let requester = from;

        let (bus1, uid1, nsp1, requester1, rid1) = (bus.clone(), uid.clone(), nsp.clone(), requester.clone(), request_id.clone());
        let client_count_cb: Box<dyn FnOnce(u64) + Send> = Box::new(move |count| {
            let msg = ClusterMessage::new(uid1, nsp1, MessageBody::BroadcastClientCount(BroadcastClientCountData { request_id: rid1, client_count: count }));
            tokio::spawn(async move {
                if let Err(e) = bus1.do_publish_response(requester1, msg).await {
                    warn!(error = %e, "failed publishing broadcast client count response");
                }
            });
        });

        let ack: SharedAck = Arc::new(move |args, _err| {
            let msg = ClusterMessage::new(uid.clone(), nsp.clone(), MessageBody::BroadcastAck(BroadcastAckData { request_id: request_id.clone(), packets: args }));
            let bus = bus.clone();
            let requester = requester.clone();
            tokio::spawn(async move {
                if let Err(e) = bus.do_publish_response(requester, msg).await {
                    warn!(error = %e, "failed publishing broadcast ack response");
                }
            });
        });

        if let Err(e) = self.inner.broadcast_with_ack(packet, opts, client_count_cb, ack).await {
            warn!(error = %e, "local broadcast_with_ack failed while relaying cluster broadcast");
        }
    }

    async fn on_sockets_join(&self, data: RoomsData) {
        self.inner.add_sockets(data.opts, data.rooms.into_iter().map(Room::from).collect()).await;
    }

    async fn on_sockets_leave(&self, data: RoomsData) {
        self.inner.del_sockets(data.opts, data.rooms.into_iter().map(Room::from).collect()).await;
    }

    async fn on_disconnect_sockets(&self, data: DisconnectSocketsData) {
        self.inner.disconnect_sockets(data.opts, data.close).await;
    }

    async fn on_fetch_sockets_request(&self, from: ServerId, data: FetchSocketsData) {
        match self.inner.fetch_sockets(data.opts).await {
            Ok(sockets) => {
                let resp = ClusterMessage::new(
                    self.uid.clone(),
                    self.nsp.clone(),
                    MessageBody::FetchSocketsResponse(FetchSocketsResponseData { request_id: data.request_id, sockets }),
                );
                if let Err(e) = self.bus.do_publish_response(from, resp).await {
                    warn!(error = %e, "failed publishing fetch_sockets response");
                }
            }
            Err(e) => warn!(error = %e, "local fetch_sockets failed while answering cluster request"),
        }
    }

    fn on_fetch_sockets_response(&self, from: &ServerId, data: FetchSocketsResponseData) {
        let Some(request) = self.requests.get(&data.request_id) else {
            debug!(request_id = ?data.request_id, "response for unknown/settled fetch_sockets request");
            return;
        };
        request.push_sockets(from, data.sockets);
    }

    async fn on_server_side_emit_request(&self, from: ServerId, data: ServerSideEmitData) {
        let Some(request_id) = data.request_id else {
            if let Some(handler) = &self.server_side_emit_handler {
                handler(data.packets);
            }
            return;
        };
        let packets = self
            .server_side_emit_handler
            .as_ref()
            .map_or_else(Vec::new, |h| h(data.packets));
        let resp = ClusterMessage::new(
            self.uid.clone(),
            self.nsp.clone(),
            MessageBody::ServerSideEmitResponse(ServerSideEmitResponseData { request_id, packets }),
        );
        if let Err(e) = self.bus.do_publish_response(from, resp).await {
            warn!(error = %e, "failed publishing server_side_emit response");
        }
    }

    fn on_server_side_emit_response(&self, from: &ServerId, data: ServerSideEmitResponseData) {
        let Some(request) = self.requests.get(&data.request_id) else {
            debug!(request_id = ?data.request_id, "response for unknown/settled server_side_emit request");
            return;
        };
        request.push_packets(from, data.packets);
    }

    fn on_broadcast_client_count(&self, data: BroadcastClientCountData) {
        let Some(entry) = self.ack_requests.get(&data.request_id).map(|e| e.value().clone()) else {
            debug!(request_id = ?data.request_id, "client count for unknown/settled ack request");
            return;
        };
        entry.peer_count_total.fetch_add(i64::try_from(data.client_count).unwrap_or(0), Ordering::SeqCst);
        let responded = entry.responded_peers.fetch_add(1, Ordering::SeqCst) + 1;
        if responded >= entry.expected_peers {
            entry.finalize_client_count();
            self.ack_requests.remove(&data.request_id);
        }
    }

    fn on_broadcast_ack(&self, data: BroadcastAckData) {
        let Some(entry) = self.ack_requests.get(&data.request_id).map(|e| e.value().clone()) else {
            debug!(request_id = ?data.request_id, "ack for unknown/settled ack request");
            return;
        };
        (entry.ack)(data.packets, None);
    }
}

#[async_trait]
impl Adapter for ClusterAdapter {
    fn add_all(&self, id: SocketId, rooms: Vec<Room>) {
        self.inner.add_all(id, rooms);
    }

    fn del(&self, id: &SocketId, room: &Room) {
        self.inner.del(id, room);
    }

    fn del_all(&self, id: &SocketId) {
        self.inner.del_all(id);
    }

    #[instrument(skip_all, fields(uid = %self.uid, nsp = %self.nsp))]
    async fn broadcast(&self, mut packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError> {
        if opts.is_local() {
            return self.inner.broadcast(packet, opts).await;
        }
        let msg = ClusterMessage::new(
            self.uid.clone(),
            self.nsp.clone(),
            MessageBody::Broadcast(BroadcastData { opts: opts.clone(), packet: packet.clone(), request_id: None }),
        );
        let offset = match self.bus.do_publish(msg).await {
            Ok(offset) => offset,
            Err(e) => {
                warn!(error = %e, "broadcast publish failed, delivering locally only");
                Offset::empty()
            }
        };
        // A non-empty offset only ever comes back from the stream
        // transport, which is exactly the transport session recovery
        // runs over -- so "offset present" doubles as "recovery active"
        // without a separate namespace-level flag.
        if !offset.is_empty() && packet.is_event() && packet.without_acknowledgement() && !opts.flags.volatile {
            packet.push_data(serde_json::Value::String(offset.as_str().to_owned()));
        }
        self.inner.broadcast(packet, opts).await
    }

    #[instrument(skip_all, fields(uid = %self.uid, nsp = %self.nsp, request_id = tracing::field::Empty))]
    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        client_count_cb: Box<dyn FnOnce(u64) + Send>,
        ack: SharedAck,
    ) -> Result<(), AdapterError> {
        if opts.is_local() {
            return self.inner.broadcast_with_ack(packet, opts, client_count_cb, ack).await;
        }

        let request_id = Self::new_request_id();
        Span::current().record("request_id", tracing::field::display(&request_id));
        let expected_peers = (self.server_count() - 1).max(0);
        let entry = Arc::new(AckRequestEntry {
            client_count_cb: Mutex::new(Some(client_count_cb)),
            ack: ack.clone(),
            local_count: AtomicI64::new(0),
            peer_count_total: AtomicI64::new(0),
            expected_peers,
            responded_peers: AtomicI64::new(0),
        });
        self.ack_requests.insert(request_id.clone(), entry.clone());

        let msg = ClusterMessage::new(
            self.uid.clone(),
            self.nsp.clone(),
            MessageBody::Broadcast(BroadcastData { opts: opts.clone(), packet: packet.clone(), request_id: Some(request_id.clone()) }),
        );
        if let Err(e) = self.bus.do_publish(msg).await {
            warn!(error = %e, "broadcast_with_ack publish failed, proceeding with local-only delivery");
        }

        let entry_for_local = entry.clone();
        let local_client_count_cb: Box<dyn FnOnce(u64) + Send> = Box::new(move |count| {
            entry_for_local.local_count.store(i64::try_from(count).unwrap_or(0), Ordering::SeqCst);
            if entry_for_local.expected_peers == 0 {
                entry_for_local.finalize_client_count();
            }
        });
        self.inner.broadcast_with_ack(packet, opts.clone(), local_client_count_cb, ack).await?;

        if expected_peers > 0 {
            let timeout = opts.flags.timeout().unwrap_or(self.request_timeout);
            let weak = self.weak_self.clone();
            let request_id_for_timer = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(adapter) = weak.upgrade() else {
                    return;
                };
                if let Some((_, entry)) = adapter.ack_requests.remove(&request_id_for_timer) {
                    entry.finalize_client_count();
                }
            });
        } else {
            self.ack_requests.remove(&request_id);
        }

        Ok(())
    }

    fn sockets(&self, rooms: &[Room]) -> Vec<SocketId> {
        self.inner.sockets(rooms)
    }

    fn socket_rooms(&self, id: &SocketId) -> Option<Vec<Room>> {
        self.inner.socket_rooms(id)
    }

    #[instrument(skip_all, fields(uid = %self.uid, nsp = %self.nsp, request_id = tracing::field::Empty))]
    async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<RemoteSocketData>, AdapterError> {
        let mut local = self.inner.fetch_sockets(opts.clone()).await?;
        let expected = self.server_count() - 1;
        if opts.is_local() || expected <= 0 {
            return Ok(local);
        }

        let request_id = Self::new_request_id();
        Span::current().record("request_id", tracing::field::display(&request_id));
        let request = Arc::new(PendingRequest::new_sockets(self.new_completion(expected)));
        self.requests.insert(request_id.clone(), request.clone());

        let msg = ClusterMessage::new(
            self.uid.clone(),
            self.nsp.clone(),
            MessageBody::FetchSockets(FetchSocketsData { opts: opts.clone(), request_id: request_id.clone() }),
        );
        if let Err(e) = self.bus.do_publish(msg).await {
            warn!(error = %e, "fetch_sockets publish failed, waiting out the timeout for stragglers");
        }

        let timeout = opts.flags.timeout().unwrap_or(self.request_timeout);
        let original_expected = request.completion.expected();
        let timed_out = tokio::time::timeout(timeout, request.wait_until_satisfied()).await.is_err();
        self.requests.remove(&request_id);

        let responded = request.completion.responded(original_expected);
        let CollectedResponses::Sockets(remote) = std::mem::replace(&mut *request.responses.lock().unwrap(), CollectedResponses::Sockets(Vec::new())) else {
            unreachable!("fetch_sockets always creates a Sockets-shaped PendingRequest")
        };
        local.extend(remote);

        if timed_out {
            return Err(AdapterError::PartialFetchSockets { responses: local, responded, expected: original_expected });
        }
        Ok(local)
    }

    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        if !opts.is_local() {
            let msg = ClusterMessage::new(self.uid.clone(), self.nsp.clone(), MessageBody::SocketsJoin(RoomsData { opts: opts.clone(), rooms: rooms.iter().map(|r| r.0.clone()).collect() }));
            if let Err(e) = self.bus.do_publish(msg).await {
                warn!(error = %e, "add_sockets publish failed, applying locally only");
            }
        }
        self.inner.add_sockets(opts, rooms).await;
    }

    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        if !opts.is_local() {
            let msg = ClusterMessage::new(self.uid.clone(), self.nsp.clone(), MessageBody::SocketsLeave(RoomsData { opts: opts.clone(), rooms: rooms.iter().map(|r| r.0.clone()).collect() }));
            if let Err(e) = self.bus.do_publish(msg).await {
                warn!(error = %e, "del_sockets publish failed, applying locally only");
            }
        }
        self.inner.del_sockets(opts, rooms).await;
    }

    async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) {
        if !opts.is_local() {
            let msg = ClusterMessage::new(self.uid.clone(), self.nsp.clone(), MessageBody::DisconnectSockets(DisconnectSocketsData { opts: opts.clone(), close }));
            if let Err(e) = self.bus.do_publish(msg).await {
                warn!(error = %e, "disconnect_sockets publish failed, applying locally only");
            }
        }
        self.inner.disconnect_sockets(opts, close).await;
    }

    #[instrument(skip_all, fields(uid = %self.uid, nsp = %self.nsp, request_id = tracing::field::Empty))]
    async fn server_side_emit(&self, packets: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, AdapterError> {
        if packets.is_empty() {
            return Err(AdapterError::Unsupported("server_side_emit requires at least one packet"));
        }
        let expected = self.server_count() - 1;
        if expected <= 0 {
            return Ok(Vec::new());
        }

        let request_id = Self::new_request_id();
        Span::current().record("request_id", tracing::field::display(&request_id));
        let request = Arc::new(PendingRequest::new_packets(self.new_completion(expected)));
        self.requests.insert(request_id.clone(), request.clone());

        let msg = ClusterMessage::new(
            self.uid.clone(),
            self.nsp.clone(),
            MessageBody::ServerSideEmit(ServerSideEmitData { request_id: Some(request_id.clone()), packets }),
        );
        if let Err(e) = self.bus.do_publish(msg).await {
            warn!(error = %e, "server_side_emit publish failed, waiting out the timeout for stragglers");
        }

        let timed_out = tokio::time::timeout(self.request_timeout, request.wait_until_satisfied()).await.is_err();
        self.requests.remove(&request_id);
        let CollectedResponses::Packets(packets) = std::mem::replace(&mut *request.responses.lock().unwrap(), CollectedResponses::Packets(Vec::new())) else {
            unreachable!("server_side_emit always creates a Packets-shaped PendingRequest")
        };
        if timed_out {
            debug!(request_id = ?request_id, "server_side_emit timed out, returning partial responses");
        }
        Ok(packets)
    }

    fn persist_session(&self, session: SessionToPersist) {
        self.inner.persist_session(session);
    }

    async fn restore_session(&self, pid: &PrivateSessionId, offset: &Offset) -> Result<Option<Session>, AdapterError> {
        self.inner.restore_session(pid, offset).await
    }

    fn server_count(&self) -> i64 {
        match &self.peer_source {
            PeerSource::Bus => self.server_count_cache.load(Ordering::Relaxed),
            PeerSource::Heartbeat(nodes) => i64::try_from(nodes.len()).unwrap_or(i64::MAX).saturating_add(1),
        }
    }
}

#[cfg(test)]
impl ClusterAdapter {
    /// Bypasses the periodic bus poll so tests can pin `ServerCount()`
    /// without waiting out the real poll interval.
    fn test_set_server_count(&self, n: i64) {
        self.server_count_cache.store(n, Ordering::Relaxed);
    }
}
