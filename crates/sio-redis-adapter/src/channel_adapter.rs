//! `RedisChannelAdapter`: the plain pub/sub transport (§4.2.2). Implements
//! `sio_cluster::Bus` over three channels per namespace and drives a
//! background subscriber that feeds decoded messages to an attached
//! `MessageSink`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use sio_cluster::{Bus, ClusterError, MessageSink};
use sio_protocol::codec::{decode, encode};
use sio_protocol::{ClusterMessage, MessageBody, Offset, ServerId};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use crate::channels::{
    broadcast_channel, broadcast_pattern, request_channel, response_channel,
    response_channel_for_uid, room_channel, single_target_room,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The Redis channel-based cluster transport. One instance is shared by
/// every namespace's `ClusterAdapter` on this node (construct one per
/// namespace, same as the adapter it feeds).
pub struct RedisChannelAdapter {
    key: String,
    nsp: String,
    uid: ServerId,
    client: Client,
    manager: AsyncMutex<Option<ConnectionManager>>,
    publish_on_specific_response_channel: bool,
    sink: StdMutex<Option<Weak<dyn MessageSink>>>,
    shutdown: Arc<Notify>,
    closed: AtomicBool,
}

impl RedisChannelAdapter {
    #[must_use]
    pub fn new(
        client: Client,
        uid: ServerId,
        nsp: impl Into<String>,
        key: impl Into<String>,
        publish_on_specific_response_channel: bool,
    ) -> Arc<Self> {
        let nsp = nsp.into();
        warn!(nsp = %nsp, "no error handler attached to this bus client; transport errors will only be logged");

        let adapter = Arc::new(Self {
            key: key.into(),
            nsp,
            uid,
            client,
            manager: AsyncMutex::new(None),
            publish_on_specific_response_channel,
            sink: StdMutex::new(None),
            shutdown: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        });

        let worker = adapter.clone();
        tokio::spawn(async move { worker.run_subscriber().await });

        adapter
    }

    /// Wires this bus to the adapter it feeds. Called once, after the
    /// adapter is constructed with this bus as its transport -- the same
    /// attach-after-construction idiom the in-process test buses use.
    pub fn attach(&self, sink: Arc<dyn MessageSink>) {
        *self.sink.lock().unwrap() = Some(Arc::downgrade(&sink));
    }

    /// Stops the subscriber loop and releases its connection. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
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

    fn channel_for_publish(&self, body: &MessageBody) -> String {
        match body {
            MessageBody::Broadcast(data) => match single_target_room(&data.opts.rooms) {
                Some(room) => room_channel(&self.key, &self.nsp, room),
                None => broadcast_channel(&self.key, &self.nsp),
            },
            _ => request_channel(&self.key, &self.nsp),
        }
    }

    async fn publish_raw(&self, channel: &str, msg: &ClusterMessage) -> Result<(), ClusterError> {
        let payload = encode(msg).map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        let mut conn = self.connection_manager().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))
    }

    async fn count_subscribers(&self, channel: &str) -> Result<i64, ClusterError> {
        let mut conn = self.connection_manager().await?;
        let (_channel, count): (String, i64) = redis::cmd("PUBSUB")
            .arg("NUMSUB")
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
                warn!(error = %e, backoff = ?backoff, nsp = %self.nsp, "redis subscriber failed, retrying");
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

    async fn subscribe_once(&self) -> Result<(), ClusterError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;

        pubsub
            .psubscribe(broadcast_pattern(&self.key, &self.nsp))
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        pubsub
            .subscribe(request_channel(&self.key, &self.nsp))
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        pubsub
            .subscribe(response_channel(&self.key, &self.nsp))
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        if self.publish_on_specific_response_channel {
            pubsub
                .subscribe(response_channel_for_uid(&self.key, &self.nsp, &self.uid))
                .await
                .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        }

        info!(nsp = %self.nsp, "redis channel subscriber connected");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                () = self.shutdown.notified() => return Ok(()),
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
                warn!(error = %e, nsp = %self.nsp, "failed decoding cluster message off redis");
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
impl Bus for RedisChannelAdapter {
    async fn do_publish(&self, msg: ClusterMessage) -> Result<Offset, ClusterError> {
        let channel = self.channel_for_publish(&msg.body);
        self.publish_raw(&channel, &msg).await?;
        Ok(Offset::empty())
    }

    async fn do_publish_response(&self, requester_uid: ServerId, resp: ClusterMessage) -> Result<(), ClusterError> {
        let channel = if self.publish_on_specific_response_channel {
            response_channel_for_uid(&self.key, &self.nsp, &requester_uid)
        } else {
            response_channel(&self.key, &self.nsp)
        };
        self.publish_raw(&channel, &resp).await
    }

    async fn server_count(&self) -> i64 {
        match self.count_subscribers(&request_channel(&self.key, &self.nsp)).await {
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
    use sio_protocol::{BroadcastData, BroadcastOptions, Packet, PacketType, Room};

    fn broadcast(rooms: Vec<Room>) -> MessageBody {
        MessageBody::Broadcast(BroadcastData {
            opts: BroadcastOptions { rooms, ..Default::default() },
            packet: Packet { ty: PacketType::Event, nsp: "/".into(), id: None, data: serde_json::json!(["x"]) },
            request_id: None,
        })
    }

    fn adapter() -> Arc<RedisChannelAdapter> {
        let client = Client::open("redis://127.0.0.1:6399").unwrap();
        RedisChannelAdapter::new(client, ServerId::new("u1"), "/", "socket.io", false)
    }

    #[tokio::test]
    async fn single_room_broadcast_targets_the_room_channel() {
        let adapter = adapter();
        let channel = adapter.channel_for_publish(&broadcast(vec![Room::new("r1")]));
        assert_eq!(channel, "socket.io#/#r1#");
        adapter.close();
    }

    #[tokio::test]
    async fn multi_room_and_whole_namespace_broadcasts_use_the_main_channel() {
        let adapter = adapter();
        assert_eq!(adapter.channel_for_publish(&broadcast(vec![])), "socket.io#/#");
        assert_eq!(
            adapter.channel_for_publish(&broadcast(vec![Room::new("r1"), Room::new("r2")])),
            "socket.io#/#",
        );
        adapter.close();
    }

    #[tokio::test]
    async fn non_broadcast_messages_use_the_request_channel() {
        let adapter = adapter();
        assert_eq!(adapter.channel_for_publish(&MessageBody::Heartbeat), "socket.io-request#/#");
        adapter.close();
    }
}
