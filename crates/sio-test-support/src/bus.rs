//! `FakeBus`: a [`Bus`] implementation over a [`FakeNetwork`], standing
//! in for `RedisChannelAdapter`/`StreamAdapter` in tests that want real
//! multi-node dispatch semantics without a live Redis.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sio_cluster::{Bus, ClusterError, MessageSink};
use sio_protocol::codec::{decode, encode};
use sio_protocol::{ClusterMessage, Offset, ServerId};

use crate::network::FakeNetwork;

pub struct FakeBus {
    network: Arc<FakeNetwork>,
    uid: ServerId,
    server_count_override: AtomicI64,
}

impl FakeBus {
    #[must_use]
    pub fn new(network: Arc<FakeNetwork>, uid: ServerId) -> Arc<Self> {
        Arc::new(Self { network, uid, server_count_override: AtomicI64::new(-1) })
    }

    /// Wires this bus to the adapter it feeds and registers it on the
    /// shared network -- the same attach-after-construction idiom the
    /// Redis and stream transports use.
    pub fn attach(&self, sink: Arc<dyn MessageSink>) {
        self.network.register(self.uid.clone(), sink);
    }

    pub fn detach(&self) {
        self.network.unregister(&self.uid);
    }

    /// Forces `server_count()` to a fixed value instead of the network's
    /// live node count, for tests that want to simulate a cluster size
    /// larger than the number of fakes actually wired up.
    pub fn set_server_count(&self, count: i64) {
        self.server_count_override.store(count, Ordering::SeqCst);
    }

    async fn publish(&self, msg: ClusterMessage) -> Result<Offset, ClusterError> {
        // Round-trips through the real wire codec so a test exercising
        // `FakeBus` still catches encode/decode regressions, the same as
        // it would against a live broker.
        let payload = encode(&msg).map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        let decoded = decode(&payload).map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        self.network.broadcast(decoded).await;
        Ok(Offset::empty())
    }
}

#[async_trait]
impl Bus for FakeBus {
    async fn do_publish(&self, msg: ClusterMessage) -> Result<Offset, ClusterError> {
        self.publish(msg).await
    }

    async fn do_publish_response(&self, _requester_uid: ServerId, resp: ClusterMessage) -> Result<(), ClusterError> {
        self.publish(resp).await.map(|_offset| ())
    }

    async fn server_count(&self) -> i64 {
        let overridden = self.server_count_override.load(Ordering::SeqCst);
        if overridden >= 0 {
            overridden
        } else {
            self.network.node_count()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sio_protocol::MessageBody;
    use std::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<MessageBody>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn on_message(&self, msg: ClusterMessage) {
            self.received.lock().unwrap().push(msg.body);
        }
    }

    #[tokio::test]
    async fn publish_is_delivered_to_every_attached_node_including_the_publisher() {
        let network = FakeNetwork::new();

        let bus_a = FakeBus::new(network.clone(), ServerId::new("a"));
        let sink_a = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        bus_a.attach(sink_a.clone());

        let bus_b = FakeBus::new(network.clone(), ServerId::new("b"));
        let sink_b = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        bus_b.attach(sink_b.clone());

        bus_a
            .do_publish(ClusterMessage::new(ServerId::new("a"), "/", MessageBody::Heartbeat))
            .await
            .unwrap();

        assert_eq!(sink_a.received.lock().unwrap().len(), 1);
        assert_eq!(sink_b.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn server_count_reflects_attached_nodes_unless_overridden() {
        let network = FakeNetwork::new();
        let bus_a = FakeBus::new(network.clone(), ServerId::new("a"));
        let sink_a = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        bus_a.attach(sink_a);
        assert_eq!(bus_a.server_count().await, 1);

        bus_a.set_server_count(5);
        assert_eq!(bus_a.server_count().await, 5);
    }

    #[tokio::test]
    async fn detach_stops_further_delivery() {
        let network = FakeNetwork::new();
        let bus_a = FakeBus::new(network.clone(), ServerId::new("a"));
        let sink_a = Arc::new(RecordingSink { received: Mutex::new(Vec::new()) });
        bus_a.attach(sink_a.clone());
        bus_a.detach();

        bus_a
            .do_publish(ClusterMessage::new(ServerId::new("a"), "/", MessageBody::Heartbeat))
            .await
            .unwrap();

        assert!(sink_a.received.lock().unwrap().is_empty());
    }
}
