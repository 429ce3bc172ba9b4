//! `FakeNetwork`: an in-memory hub every [`crate::bus::FakeBus`] on the
//! same test publishes into. Plays the role a real Redis deployment
//! plays for `sio-redis-adapter`/`sio-stream-adapter` -- one shared
//! medium, many nodes attached to it -- so `sio-cluster`'s dispatch
//! logic (self-filtering, heartbeat eviction, pending-request
//! completion) is exercised without a live broker.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use sio_cluster::MessageSink;
use sio_protocol::{ClusterMessage, ServerId};

#[derive(Default)]
pub struct FakeNetwork {
    nodes: DashMap<ServerId, Weak<dyn MessageSink>>,
}

impl FakeNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, uid: ServerId, sink: Arc<dyn MessageSink>) {
        self.nodes.insert(uid, Arc::downgrade(&sink));
    }

    pub fn unregister(&self, uid: &ServerId) {
        self.nodes.remove(uid);
    }

    #[must_use]
    pub fn node_count(&self) -> i64 {
        self.nodes.len() as i64
    }

    /// Delivers `msg` to every registered node, including its publisher --
    /// a real pub/sub or stream transport re-delivers a publisher's own
    /// message back to it just the same, and callers (`ClusterAdapter`)
    /// are responsible for self-filtering by `Uid`.
    pub async fn broadcast(&self, msg: ClusterMessage) {
        let sinks: Vec<_> = self.nodes.iter().map(|e| e.value().clone()).collect();
        for sink in sinks {
            if let Some(sink) = sink.upgrade() {
                sink.on_message(msg.clone()).await;
            }
        }
    }
}
