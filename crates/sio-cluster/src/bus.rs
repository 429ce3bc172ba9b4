//! `Bus`: the abstract transport hook every cluster adapter publishes
//! through (§4.2's `DoPublish`/`DoPublishResponse`). Concrete transports
//! (`sio-redis-adapter`, `sio-stream-adapter`) implement this; `sio-cluster`
//! never depends on a specific bus.
//!
//! Per §9's design note, the base/subclass relationship described in the
//! source ("prototype pattern... subclasses override base methods") is
//! realized here as interface composition: the transport is supplied to
//! `ClusterAdapter` at construction as a trait object, never invoked from
//! within a base constructor.

use async_trait::async_trait;
use sio_protocol::{ClusterMessage, Offset, ServerId};

use crate::error::ClusterError;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publishes a message to every other node. Returns the transport's
    /// assigned offset (non-empty only for the stream transport; empty
    /// for pub/sub-style transports that don't order messages).
    async fn do_publish(&self, msg: ClusterMessage) -> Result<Offset, ClusterError>;

    /// Publishes a response addressed (where the transport supports it)
    /// to a specific requester.
    async fn do_publish_response(&self, requester_uid: ServerId, resp: ClusterMessage) -> Result<(), ClusterError>;

    /// Number of nodes sharing this namespace's bus, including this one.
    /// Channel transports answer this via subscriber introspection
    /// (`PUBSUB NUMSUB`); it's a network round trip, hence async.
    async fn server_count(&self) -> i64;
}
