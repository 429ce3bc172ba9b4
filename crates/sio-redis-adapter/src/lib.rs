//! Redis-backed transports for `sio-cluster`'s `Bus` trait: the plain
//! channel-based adapter (§4.2.2) and the sharded-channel adapter for
//! Redis Cluster deployments (§4.2.3).

pub mod channel_adapter;
pub mod channels;
pub mod sharded_adapter;

pub use channel_adapter::RedisChannelAdapter;
pub use sharded_adapter::{ShardMode, ShardedChannelAdapter};
