//! The slice of `Socket`/`Namespace` the adapter is allowed to touch.
//!
//! The actual connection object, handshake parsing and transport write
//! path are out of scope (owned by the duplex connection layer); these
//! traits are the seam the adapter calls through.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sio_protocol::SocketId;

use crate::error::AckError;

/// Immutable at creation; never mutated by the adapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Handshake {
    pub headers: HashMap<String, String>,
    pub remote_addr: String,
    pub issued_at: i64,
    pub query: HashMap<String, String>,
    pub auth: serde_json::Value,
}

/// Pre-encoded frames for a single packet, shared (not recopied) across
/// every socket a broadcast fans out to.
pub type EncodedFrames = Arc<Vec<Vec<u8>>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub volatile: bool,
    pub compress: Option<bool>,
    pub pre_encoded: bool,
}

/// Invoked once, by whichever single client it was registered against.
pub type AckFn = Box<dyn FnOnce(Vec<serde_json::Value>, Option<AckError>) + Send>;

/// The caller-supplied ack for `BroadcastWithAck`: every responding client
/// invokes its own copy, so this has to be `Fn`, shared via `Arc`, not a
/// one-shot `FnOnce` (invariant: called at most once *per responding
/// client*, but overall once per client that replies).
pub type SharedAck = Arc<dyn Fn(Vec<serde_json::Value>, Option<AckError>) + Send + Sync>;

/// The operations the adapter performs against a connected socket.
pub trait Socket: Send + Sync {
    fn id(&self) -> &SocketId;
    fn handshake(&self) -> &Handshake;
    fn data(&self) -> serde_json::Value;
    fn write_to_engine(&self, frames: EncodedFrames, opts: WriteOptions);
    fn register_ack(&self, packet_id: u64, ack: AckFn);
    fn notify_outgoing_listeners(&self, packet: &sio_protocol::Packet);
}

/// The namespace-side lookup the adapter needs: resolving a `SocketId` to
/// a live socket (skipping ones mid-teardown), and a monotonic per-packet
/// id counter shared by every `BroadcastWithAck` call in the namespace.
pub trait NamespaceSockets: Send + Sync {
    fn name(&self) -> &str;
    fn get_socket(&self, id: &SocketId) -> Option<Arc<dyn Socket>>;
    fn next_packet_id(&self) -> u64;
}

/// Encodes a packet into wire frames exactly once per broadcast, per the
/// outer adapter's contract ("the outer Adapter MUST call the encoder at
/// most once per Broadcast"). Implemented by the (out-of-scope) protocol
/// codec; this crate only ever calls it through the trait.
pub trait PacketEncoder: Send + Sync {
    fn encode(&self, packet: &sio_protocol::Packet, binary: bool) -> EncodedFrames;
}
