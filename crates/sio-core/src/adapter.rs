//! The `Adapter` trait: every operation a `Namespace` performs through its
//! adapter (§6). `LocalAdapter` (this crate) and `ClusterAdapter` /
//! `HeartbeatClusterAdapter` (`sio-cluster`) all implement it, so a
//! namespace can be handed any of them interchangeably.

use async_trait::async_trait;
use sio_protocol::{
    BroadcastOptions, Offset, Packet, PrivateSessionId, RemoteSocketData, Room, Session,
    SessionToPersist, SocketId,
};

use crate::error::AdapterError;
use crate::socket::SharedAck;

#[async_trait]
pub trait Adapter: Send + Sync {
    fn add_all(&self, id: SocketId, rooms: Vec<Room>);
    fn del(&self, id: &SocketId, room: &Room);
    fn del_all(&self, id: &SocketId);

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError>;

    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        client_count_cb: Box<dyn FnOnce(u64) + Send>,
        ack: SharedAck,
    ) -> Result<(), AdapterError>;

    fn sockets(&self, rooms: &[Room]) -> Vec<SocketId>;
    fn socket_rooms(&self, id: &SocketId) -> Option<Vec<Room>>;

    async fn fetch_sockets(
        &self,
        opts: BroadcastOptions,
    ) -> Result<Vec<RemoteSocketData>, AdapterError>;
    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>);
    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>);
    async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool);

    async fn server_side_emit(
        &self,
        packets: Vec<serde_json::Value>,
    ) -> Result<Vec<serde_json::Value>, AdapterError>;

    fn persist_session(&self, session: SessionToPersist);
    async fn restore_session(
        &self,
        pid: &PrivateSessionId,
        offset: &Offset,
    ) -> Result<Option<Session>, AdapterError>;

    fn server_count(&self) -> i64;
}
