//! `MessageSink`: the receiving half of the transport seam. A `Bus`
//! implementation only ever holds a `Weak<dyn MessageSink>` back to the
//! adapter it feeds, attached after construction (the same
//! attach-after-the-fact idiom the in-crate test buses already use for
//! their own `Weak<ClusterAdapter>` handles).

use async_trait::async_trait;
use sio_protocol::ClusterMessage;

use crate::base::ClusterAdapter;
use crate::heartbeat::HeartbeatClusterAdapter;

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn on_message(&self, msg: ClusterMessage);
}

#[async_trait]
impl MessageSink for ClusterAdapter {
    async fn on_message(&self, msg: ClusterMessage) {
        ClusterAdapter::on_message(self, msg).await;
    }
}

#[async_trait]
impl MessageSink for HeartbeatClusterAdapter {
    async fn on_message(&self, msg: ClusterMessage) {
        HeartbeatClusterAdapter::on_message(self, msg).await;
    }
}
