pub mod base;
pub mod bus;
pub mod error;
pub mod heartbeat;
pub mod pending;
pub mod sink;

pub use base::{ClusterAdapter, PeerSource, ServerSideEmitHandler, DEFAULT_REQUEST_TIMEOUT};
pub use bus::Bus;
pub use error::ClusterError;
pub use heartbeat::{HeartbeatClusterAdapter, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};
pub use pending::{AckRequestEntry, CollectedResponses, Completion, PendingRequest};
pub use sink::MessageSink;
