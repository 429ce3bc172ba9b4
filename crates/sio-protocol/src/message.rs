//! `ClusterMessage`: the tagged union of every inter-node message.
//!
//! The numeric `type` tags are contractually stable (see module docs on
//! each variant) -- they're carried on the wire and must never be
//! renumbered. We model the union as a plain Rust enum (never an untyped
//! JSON bag, per the "dynamic dispatch on message payloads" design note)
//! and convert to/from a flat wire struct at the serde boundary so the
//! numeric tag survives both the JSON and MessagePack encodings.

use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, ServerId, SocketId};
use crate::options::BroadcastOptions;
use crate::packet::Packet;

/// One entry of `FETCH_SOCKETS_RESPONSE`: a socket living on a remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSocketData {
    pub id: SocketId,
    pub handshake: serde_json::Value,
    pub rooms: Vec<String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastData {
    pub opts: BroadcastOptions,
    pub packet: Packet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomsData {
    pub opts: BroadcastOptions,
    pub rooms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectSocketsData {
    pub opts: BroadcastOptions,
    pub close: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSocketsData {
    pub opts: BroadcastOptions,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSocketsResponseData {
    pub request_id: RequestId,
    pub sockets: Vec<RemoteSocketData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSideEmitData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub packets: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSideEmitResponseData {
    pub request_id: RequestId,
    pub packets: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastClientCountData {
    pub request_id: RequestId,
    pub client_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastAckData {
    pub request_id: RequestId,
    pub packets: Vec<serde_json::Value>,
}

/// The body of a [`ClusterMessage`]. Each variant corresponds 1:1 to a
/// numeric `type` tag; see [`MessageBody::tag`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    InitialHeartbeat,
    Heartbeat,
    Broadcast(BroadcastData),
    SocketsJoin(RoomsData),
    SocketsLeave(RoomsData),
    DisconnectSockets(DisconnectSocketsData),
    FetchSockets(FetchSocketsData),
    FetchSocketsResponse(FetchSocketsResponseData),
    ServerSideEmit(ServerSideEmitData),
    ServerSideEmitResponse(ServerSideEmitResponseData),
    BroadcastClientCount(BroadcastClientCountData),
    BroadcastAck(BroadcastAckData),
    AdapterClose,
}

impl MessageBody {
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            MessageBody::InitialHeartbeat => 1,
            MessageBody::Heartbeat => 2,
            MessageBody::Broadcast(_) => 3,
            MessageBody::SocketsJoin(_) => 4,
            MessageBody::SocketsLeave(_) => 5,
            MessageBody::DisconnectSockets(_) => 6,
            MessageBody::FetchSockets(_) => 7,
            MessageBody::FetchSocketsResponse(_) => 8,
            MessageBody::ServerSideEmit(_) => 9,
            MessageBody::ServerSideEmitResponse(_) => 10,
            MessageBody::BroadcastClientCount(_) => 11,
            MessageBody::BroadcastAck(_) => 12,
            MessageBody::AdapterClose => 13,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub uid: ServerId,
    pub nsp: String,
    pub body: MessageBody,
}

impl ClusterMessage {
    #[must_use]
    pub fn new(uid: ServerId, nsp: impl Into<String>, body: MessageBody) -> Self {
        Self { uid, nsp: nsp.into(), body }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Wire {
    uid: ServerId,
    nsp: String,
    #[serde(rename = "type")]
    type_: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageCodecError {
    #[error("unknown ClusterMessage type tag {0}")]
    UnknownType(u8),
    #[error("ClusterMessage type {0} requires a data payload but none was present")]
    MissingData(u8),
    #[error("ClusterMessage type {0} carries a data payload but none was expected")]
    UnexpectedData(u8),
    #[error("malformed ClusterMessage payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl TryFrom<Wire> for ClusterMessage {
    type Error = MessageCodecError;

    fn try_from(wire: Wire) -> Result<Self, Self::Error> {
        fn need(tag: u8, data: Option<serde_json::Value>) -> Result<serde_json::Value, MessageCodecError> {
            data.ok_or(MessageCodecError::MissingData(tag))
        }

        let body = match wire.type_ {
            1 => {
                no_data(1, &wire.data)?;
                MessageBody::InitialHeartbeat
            }
            2 => {
                no_data(2, &wire.data)?;
                MessageBody::Heartbeat
            }
            3 => MessageBody::Broadcast(serde_json::from_value(need(3, wire.data)?)?),
            4 => MessageBody::SocketsJoin(serde_json::from_value(need(4, wire.data)?)?),
            5 => MessageBody::SocketsLeave(serde_json::from_value(need(5, wire.data)?)?),
            6 => MessageBody::DisconnectSockets(serde_json::from_value(need(6, wire.data)?)?),
            7 => MessageBody::FetchSockets(serde_json::from_value(need(7, wire.data)?)?),
            8 => MessageBody::FetchSocketsResponse(serde_json::from_value(need(8, wire.data)?)?),
            9 => MessageBody::ServerSideEmit(serde_json::from_value(need(9, wire.data)?)?),
            10 => MessageBody::ServerSideEmitResponse(serde_json::from_value(need(10, wire.data)?)?),
            11 => MessageBody::BroadcastClientCount(serde_json::from_value(need(11, wire.data)?)?),
            12 => MessageBody::BroadcastAck(serde_json::from_value(need(12, wire.data)?)?),
            13 => {
                no_data(13, &wire.data)?;
                MessageBody::AdapterClose
            }
            other => return Err(MessageCodecError::UnknownType(other)),
        };

        Ok(ClusterMessage {
            uid: wire.uid,
            nsp: wire.nsp,
            body,
        })
    }
}

fn no_data(tag: u8, data: &Option<serde_json::Value>) -> Result<(), MessageCodecError> {
    match data {
        None | Some(serde_json::Value::Null) => Ok(()),
        Some(_) => Err(MessageCodecError::UnexpectedData(tag)),
    }
}

impl TryFrom<ClusterMessage> for Wire {
    type Error = MessageCodecError;

    fn try_from(msg: ClusterMessage) -> Result<Self, Self::Error> {
        let type_ = msg.body.tag();
        let data = match msg.body {
            MessageBody::InitialHeartbeat | MessageBody::Heartbeat | MessageBody::AdapterClose => None,
            MessageBody::Broadcast(d) => Some(serde_json::to_value(d)?),
            MessageBody::SocketsJoin(d) | MessageBody::SocketsLeave(d) => Some(serde_json::to_value(d)?),
            MessageBody::DisconnectSockets(d) => Some(serde_json::to_value(d)?),
            MessageBody::FetchSockets(d) => Some(serde_json::to_value(d)?),
            MessageBody::FetchSocketsResponse(d) => Some(serde_json::to_value(d)?),
            MessageBody::ServerSideEmit(d) => Some(serde_json::to_value(d)?),
            MessageBody::ServerSideEmitResponse(d) => Some(serde_json::to_value(d)?),
            MessageBody::BroadcastClientCount(d) => Some(serde_json::to_value(d)?),
            MessageBody::BroadcastAck(d) => Some(serde_json::to_value(d)?),
        };
        Ok(Wire {
            uid: msg.uid,
            nsp: msg.nsp,
            type_,
            data,
        })
    }
}

impl Serialize for ClusterMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let wire = Wire::try_from(self.clone()).map_err(serde::ser::Error::custom)?;
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClusterMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = Wire::deserialize(deserializer)?;
        ClusterMessage::try_from(wire).map_err(serde::de::Error::custom)
    }
}
