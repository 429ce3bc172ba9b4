//! Wire-stable types for the cluster broadcast adapter protocol.
//!
//! This crate has no I/O of its own: it's the shared vocabulary the
//! cluster adapter (`sio-cluster`) and each transport (`sio-redis-adapter`,
//! `sio-stream-adapter`) encode/decode against.

pub mod codec;
pub mod ids;
pub mod message;
pub mod options;
pub mod packet;
pub mod session;

pub use codec::{decode, encode, encode_json, CodecError};
pub use ids::{next_offset, Offset, PrivateSessionId, RequestId, Room, ServerId, SocketId, EMITTER_UID};
pub use message::{
    BroadcastAckData, BroadcastClientCountData, BroadcastData, ClusterMessage,
    DisconnectSocketsData, FetchSocketsData, FetchSocketsResponseData, MessageBody,
    MessageCodecError, RemoteSocketData, RoomsData, ServerSideEmitData, ServerSideEmitResponseData,
};
pub use options::{BroadcastFlags, BroadcastOptions};
pub use packet::{Packet, PacketType};
pub use session::{should_include_packet, PersistedPacket, PersistedSession, Session, SessionToPersist};
