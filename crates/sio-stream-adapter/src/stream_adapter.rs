//! `StreamAdapter`: the per-namespace `Bus` handle over a shared
//! [`crate::builder::StreamBuilder`] (§4.2.4). `DoPublish` and
//! `DoPublishResponse` both append to the same stream -- ordering and
//! dispatch both come from the builder's single poller, so there is no
//! separate response channel to maintain.

use std::sync::Arc;

use async_trait::async_trait;
use sio_cluster::{Bus, ClusterError, MessageSink};
use sio_protocol::{ClusterMessage, Offset, ServerId};

use crate::builder::StreamBuilder;

pub struct StreamAdapter {
    builder: Arc<StreamBuilder>,
    nsp: String,
    uid: ServerId,
}

impl StreamAdapter {
    #[must_use]
    pub fn new(builder: Arc<StreamBuilder>, uid: ServerId, nsp: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { builder, nsp: nsp.into(), uid })
    }

    /// Wires this bus to the adapter it feeds, via the shared builder.
    pub fn attach(&self, sink: Arc<dyn MessageSink>) {
        self.builder.attach(self.nsp.clone(), sink);
    }

    pub fn detach(&self) {
        self.builder.detach(&self.nsp);
    }

    #[must_use]
    pub fn uid(&self) -> &ServerId {
        &self.uid
    }
}

#[async_trait]
impl Bus for StreamAdapter {
    async fn do_publish(&self, msg: ClusterMessage) -> Result<Offset, ClusterError> {
        self.builder.publish(&msg).await
    }

    async fn do_publish_response(&self, _requester_uid: ServerId, resp: ClusterMessage) -> Result<(), ClusterError> {
        self.builder.publish(&resp).await.map(|_offset| ())
    }

    async fn server_count(&self) -> i64 {
        // Streams carry no subscriber-introspection concept the way
        // pub/sub channels do; a `StreamAdapter` is meant to be paired
        // with `HeartbeatClusterAdapter` (`PeerSource::Heartbeat`), which
        // never calls this method.
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{DEFAULT_MAX_LEN, DEFAULT_READ_BLOCK, DEFAULT_READ_COUNT, DEFAULT_STREAM_NAME};
    use redis::Client;

    fn adapter() -> Arc<StreamAdapter> {
        let client = Client::open("redis://127.0.0.1:6399").unwrap();
        let builder = StreamBuilder::new(client, DEFAULT_STREAM_NAME, DEFAULT_MAX_LEN, DEFAULT_READ_COUNT, DEFAULT_READ_BLOCK);
        StreamAdapter::new(builder, ServerId::new("u1"), "/")
    }

    #[test]
    fn exposes_its_own_uid() {
        let adapter = adapter();
        assert_eq!(adapter.uid(), &ServerId::new("u1"));
    }
}
