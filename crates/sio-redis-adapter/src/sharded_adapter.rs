//! `ShardedChannelAdapter`: the sharded pub/sub transport (§4.2.3), for
//! Redis Cluster deployments where ordinary `PUBLISH`/`SUBSCRIBE` would
//! all route through a single shard. Uses `SPUBLISH`/`SSUBSCRIBE` so
//! traffic for a namespace can be served by whichever shard owns its key
//! slot.
//!
//! Sharded pub/sub has no pattern subscriptions, so unlike
//! [`crate::channel_adapter::RedisChannelAdapter`] the per-room channel
//! isn't just a delivery-narrowing courtesy: a node only ever sees
//! traffic for the exact channels it has subscribed to.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use sio_cluster::{Bus, ClusterError, MessageSink};
use sio_protocol::codec::{decode, encode};
use sio_protocol::{ClusterMessage, MessageBody, Offset, Room, ServerId};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use crate::channels::{broadcast_channel, request_channel, room_channel, single_target_room};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Which rooms get their own dedicated sharded channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardMode {
    /// Only the two base channels (broadcast + request) are ever used.
    Static,
    /// `track_room`/`untrack_room` subscribe a per-room channel, except
    /// for rooms whose name is exactly 20 characters -- the implicit
    /// per-socket room every connection joins, which would otherwise
    /// produce one dedicated channel per connected client.
    Dynamic,
    /// Like `Dynamic` but without the length-20 exclusion: every tracked
    /// room gets its own channel, including implicit per-socket rooms.
    DynamicPrivate,
}

/// A room name exactly this long is assumed to be the implicit
/// per-socket room (the connection's own socket id), not a room a
/// client explicitly joined.
const IMPLICIT_ROOM_NAME_LEN: usize = 20;

#[must_use]
fn is_trackable(mode: ShardMode, room: &Room) -> bool {
    match mode {
        ShardMode::Static => false,
        ShardMode::Dynamic => room.as_str().len() != IMPLICIT_ROOM_NAME_LEN,
        ShardMode::DynamicPrivate => true,
    }
}

pub struct ShardedChannelAdapter {
    key: String,
    nsp: String,
    uid: ServerId,
    mode: ShardMode,
    client: Client,
    manager: AsyncMutex<Option<ConnectionManager>>,
    sink: StdMutex<Option<Weak<dyn MessageSink>>>,
    /// Reference counts for dynamically-tracked per-room channels: a room
    /// stays subscribed while at least one local caller still wants it.
    dynamic_rooms: Arc<DashMap<Room, AtomicU32>>,
    resubscribe: Arc<Notify>,
    shutdown: Arc<Notify>,
    closed: AtomicBool,
}

impl ShardedChannelAdapter {
    #[must_use]
    pub fn new(client: Client, uid: ServerId, nsp: impl Into<String>, key: impl Into<String>, mode: ShardMode) -> Arc<Self> {
        let nsp = nsp.into();
        warn!(nsp = %nsp, "no error handler attached to this bus client; transport errors will only be logged");

        let adapter = Arc::new(Self {
            key: key.into(),
            nsp,
            uid,
            mode,
            client,
            manager: AsyncMutex::new(None),
            sink: StdMutex::new(None),
            dynamic_rooms: Arc::new(DashMap::new()),
            resubscribe: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        });

        let worker = adapter.clone();
        tokio::spawn(async move { worker.run_subscriber().await });

        adapter
    }

    pub fn attach(&self, sink: Arc<dyn MessageSink>) {
        *self.sink.lock().unwrap() = Some(Arc::downgrade(&sink));
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Registers interest in `room`'s dedicated channel (e.g. because a
    /// local socket just joined it). A no-op under `ShardMode::Static`.
    /// Reconnects the subscriber so the new channel takes effect; callers
    /// are expected to wire this to the same room-join path that calls
    /// the inner adapter's `add_all`.
    pub fn track_room(&self, room: &Room) {
        if !is_trackable(self.mode, room) {
            return;
        }
        let count = self.dynamic_rooms.entry(room.clone()).or_insert_with(|| AtomicU32::new(0));
        if count.fetch_add(1, Ordering::SeqCst) == 0 {
            self.resubscribe.notify_waiters();
        }
    }

    /// Releases interest in `room`'s dedicated channel. The channel is
    /// dropped from the subscription set once its reference count hits
    /// zero.
    pub fn untrack_room(&self, room: &Room) {
        if !is_trackable(self.mode, room) {
            return;
        }
        let Some(count) = self.dynamic_rooms.get(room) else {
            return;
        };
        if count.value().fetch_sub(1, Ordering::SeqCst) == 1 {
            drop(count);
            self.dynamic_rooms.remove(room);
            self.resubscribe.notify_waiters();
        }
    }

    async fn connection_manager(&self) -> Result<ConnectionManager, ClusterError> {
        let mut guard = self.manager.lock().await;
        if let Some(conn) = &*guard {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Picks the channel a publish goes out on. `broadcast_with_ack`
    /// (a `Broadcast` carrying a `request_id`) always targets the main
    /// channel: a peer not subscribed to a room's dedicated channel would
    /// never see the request and so could never be counted as having
    /// responded, under-counting `ServerCount()` for that ack.
    fn channel_for_publish(&self, body: &MessageBody) -> String {
        if let MessageBody::Broadcast(data) = body {
            if data.request_id.is_none() {
                if let Some(room) = single_target_room(&data.opts.rooms) {
                    if is_trackable(self.mode, room) {
                        return room_channel(&self.key, &self.nsp, room);
                    }
                }
            }
        }
        match body {
            MessageBody::Broadcast(_) => broadcast_channel(&self.key, &self.nsp),
            _ => request_channel(&self.key, &self.nsp),
        }
    }

    async fn spublish(&self, channel: &str, msg: &ClusterMessage) -> Result<(), ClusterError> {
        let payload = encode(msg).map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        let mut conn = self.connection_manager().await?;
        let result: Result<(), redis::RedisError> = redis::cmd("SPUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        result.map_err(|e| ClusterError::BusTransportError(e.to_string()))
    }

    async fn count_shard_subscribers(&self, channel: &str) -> Result<i64, ClusterError> {
        let mut conn = self.connection_manager().await?;
        let (_channel, count): (String, i64) = redis::cmd("PUBSUB")
            .arg("SHARDNUMSUB")
            .arg(channel)
            .query_async(&mut conn)
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        Ok(count)
    }

    async fn run_subscriber(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.subscribe_once().await {
                warn!(error = %e, backoff = ?backoff, nsp = %self.nsp, "sharded redis subscriber failed, retrying");
            } else {
                backoff = INITIAL_BACKOFF;
            }
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                () = self.shutdown.notified() => return,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Runs one subscriber connection until it drops, a room is tracked
    /// or untracked (forcing a resubscribe with the new channel set), or
    /// `close` is called.
    async fn subscribe_once(&self) -> Result<(), ClusterError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;

        pubsub
            .ssubscribe(broadcast_channel(&self.key, &self.nsp))
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        pubsub
            .ssubscribe(request_channel(&self.key, &self.nsp))
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        for entry in self.dynamic_rooms.iter() {
            pubsub
                .ssubscribe(room_channel(&self.key, &self.nsp, entry.key()))
                .await
                .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        }

        info!(nsp = %self.nsp, mode = ?self.mode, "sharded redis subscriber connected");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                () = self.shutdown.notified() => return Ok(()),
                () = self.resubscribe.notified() => return Ok(()),
                msg = stream.next() => {
                    match msg {
                        Some(msg) => self.handle_payload(msg.get_payload_bytes()).await,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_payload(&self, payload: &[u8]) {
        let msg = match decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, nsp = %self.nsp, "failed decoding cluster message off sharded redis");
                return;
            }
        };
        let sink = self.sink.lock().unwrap().clone();
        let Some(sink) = sink.and_then(|s| s.upgrade()) else {
            debug!(nsp = %self.nsp, "dropping message, no sink attached yet");
            return;
        };
        sink.on_message(msg).await;
    }
}

#[async_trait]
impl Bus for ShardedChannelAdapter {
    async fn do_publish(&self, msg: ClusterMessage) -> Result<Offset, ClusterError> {
        let channel = self.channel_for_publish(&msg.body);
        self.spublish(&channel, &msg).await?;
        Ok(Offset::empty())
    }

    async fn do_publish_response(&self, _requester_uid: ServerId, resp: ClusterMessage) -> Result<(), ClusterError> {
        self.spublish(&request_channel(&self.key, &self.nsp), &resp).await
    }

    async fn server_count(&self) -> i64 {
        match self.count_shard_subscribers(&request_channel(&self.key, &self.nsp)).await {
            Ok(n) => n.max(1),
            Err(e) => {
                warn!(error = %e, nsp = %self.nsp, "server_count failed, assuming single node");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sio_protocol::{BroadcastData, BroadcastOptions, Packet, PacketType};

    fn broadcast(rooms: Vec<Room>, request_id: Option<sio_protocol::RequestId>) -> MessageBody {
        MessageBody::Broadcast(BroadcastData {
            opts: BroadcastOptions { rooms, ..Default::default() },
            packet: Packet { ty: PacketType::Event, nsp: "/".into(), id: None, data: serde_json::json!(["x"]) },
            request_id,
        })
    }

    fn adapter(mode: ShardMode) -> Arc<ShardedChannelAdapter> {
        let client = Client::open("redis://127.0.0.1:6399").unwrap();
        ShardedChannelAdapter::new(client, ServerId::new("u1"), "/", "socket.io", mode)
    }

    #[test]
    fn implicit_socket_room_is_excluded_from_dynamic_tracking() {
        let sid_room = Room::new("a".repeat(20));
        assert!(!is_trackable(ShardMode::Dynamic, &sid_room));
        assert!(is_trackable(ShardMode::DynamicPrivate, &sid_room));
        assert!(!is_trackable(ShardMode::Static, &sid_room));

        let named_room = Room::new("lobby");
        assert!(is_trackable(ShardMode::Dynamic, &named_room));
    }

    #[tokio::test]
    async fn static_mode_never_uses_a_room_channel() {
        let adapter = adapter(ShardMode::Static);
        let channel = adapter.channel_for_publish(&broadcast(vec![Room::new("lobby")], None));
        assert_eq!(channel, "socket.io#/#");
        adapter.close();
    }

    #[tokio::test]
    async fn dynamic_mode_uses_room_channel_for_single_named_room() {
        let adapter = adapter(ShardMode::Dynamic);
        let channel = adapter.channel_for_publish(&broadcast(vec![Room::new("lobby")], None));
        assert_eq!(channel, "socket.io#/#lobby#");
        adapter.close();
    }

    #[tokio::test]
    async fn broadcast_with_ack_always_uses_the_main_channel() {
        let adapter = adapter(ShardMode::Dynamic);
        let channel = adapter.channel_for_publish(&broadcast(vec![Room::new("lobby")], Some(sio_protocol::RequestId::new("r1"))));
        assert_eq!(channel, "socket.io#/#");
        adapter.close();
    }

    #[tokio::test]
    async fn track_untrack_room_is_reference_counted() {
        let adapter = adapter(ShardMode::Dynamic);
        let room = Room::new("lobby");
        adapter.track_room(&room);
        adapter.track_room(&room);
        assert_eq!(adapter.dynamic_rooms.get(&room).unwrap().load(Ordering::SeqCst), 2);
        adapter.untrack_room(&room);
        assert!(adapter.dynamic_rooms.contains_key(&room));
        adapter.untrack_room(&room);
        assert!(!adapter.dynamic_rooms.contains_key(&room));
        adapter.close();
    }
}
