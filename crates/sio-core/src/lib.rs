//! In-process adapter: the room/sid index, fluent broadcast operator and
//! session-recovery wrapper every cluster adapter builds on (§4.1, §4.4,
//! §4.3).

pub mod adapter;
pub mod error;
pub mod events;
pub mod local;
pub mod operator;
pub mod session;
pub mod socket;

pub use adapter::Adapter;
pub use error::{AckError, AdapterError};
pub use events::{AdapterEvent, EventSink};
pub use local::LocalAdapter;
pub use operator::BroadcastOperator;
pub use session::{SessionAwareAdapter, DEFAULT_MAX_DISCONNECTION_DURATION};
pub use socket::{AckFn, EncodedFrames, Handshake, NamespaceSockets, PacketEncoder, SharedAck, Socket, WriteOptions};
