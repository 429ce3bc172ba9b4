//! `StreamSessionStore`: the Redis-stream-backed session store (§4.3,
//! second half). Wraps an inner [`Adapter`] exactly the way
//! [`sio_core::SessionAwareAdapter`] does, but persists disconnected
//! sessions to a Redis key instead of an in-process map, and replays
//! missed packets by walking the same stream a paired
//! [`crate::stream_adapter::StreamAdapter`] publishes to -- rather than
//! a locally-kept log.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use sio_core::{Adapter, AdapterError, SharedAck};
use sio_protocol::{
    next_offset, should_include_packet, BroadcastOptions, MessageBody, Offset, Packet,
    PersistedSession, PrivateSessionId, RemoteSocketData, Room, Session, SessionToPersist, SocketId,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

pub const DEFAULT_SESSION_KEY_PREFIX: &str = "sio:session:";
pub const DEFAULT_RESTORE_SESSION_MAX_XRANGE_CALLS: usize = 100;

pub struct StreamSessionStore {
    inner: Arc<dyn Adapter>,
    nsp: String,
    client: Client,
    manager: Arc<AsyncMutex<Option<ConnectionManager>>>,
    stream_name: String,
    session_key_prefix: String,
    max_disconnection_duration: Duration,
    restore_session_max_xrange_calls: usize,
}

impl StreamSessionStore {
    #[must_use]
    pub fn new(
        inner: Arc<dyn Adapter>,
        client: Client,
        nsp: impl Into<String>,
        stream_name: impl Into<String>,
        session_key_prefix: impl Into<String>,
        max_disconnection_duration: Duration,
        restore_session_max_xrange_calls: usize,
    ) -> Self {
        Self {
            inner,
            nsp: nsp.into(),
            client,
            manager: Arc::new(AsyncMutex::new(None)),
            stream_name: stream_name.into(),
            session_key_prefix: session_key_prefix.into(),
            max_disconnection_duration,
            restore_session_max_xrange_calls,
        }
    }

    async fn connection_manager(&self) -> Result<ConnectionManager, String> {
        connection_manager_of(&self.client, &self.manager).await
    }

    fn session_key(&self, pid: &PrivateSessionId) -> String {
        format!("{}{}", self.session_key_prefix, pid.as_str())
    }
}

async fn connection_manager_of(client: &Client, manager: &AsyncMutex<Option<ConnectionManager>>) -> Result<ConnectionManager, String> {
    let mut guard = manager.lock().await;
    if let Some(conn) = &*guard {
        return Ok(conn.clone());
    }
    let conn = ConnectionManager::new(client.clone()).await.map_err(|e| e.to_string())?;
    *guard = Some(conn.clone());
    Ok(conn)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn i64_from_duration(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `^[0-9]+-[0-9]+$` without pulling in a regex dependency for one check.
fn is_well_formed_offset(offset: &Offset) -> bool {
    let Some((ts, seq)) = offset.as_str().split_once('-') else {
        return false;
    };
    !ts.is_empty() && !seq.is_empty() && ts.bytes().all(|b| b.is_ascii_digit()) && seq.bytes().all(|b| b.is_ascii_digit())
}

#[async_trait]
impl Adapter for StreamSessionStore {
    fn add_all(&self, id: SocketId, rooms: Vec<Room>) {
        self.inner.add_all(id, rooms);
    }

    fn del(&self, id: &SocketId, room: &Room) {
        self.inner.del(id, room);
    }

    fn del_all(&self, id: &SocketId) {
        self.inner.del_all(id);
    }

    async fn broadcast(&self, packet: Packet, opts: BroadcastOptions) -> Result<(), AdapterError> {
        self.inner.broadcast(packet, opts).await
    }

    async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
        client_count_cb: Box<dyn FnOnce(u64) + Send>,
        ack: SharedAck,
    ) -> Result<(), AdapterError> {
        self.inner.broadcast_with_ack(packet, opts, client_count_cb, ack).await
    }

    fn sockets(&self, rooms: &[Room]) -> Vec<SocketId> {
        self.inner.sockets(rooms)
    }

    fn socket_rooms(&self, id: &SocketId) -> Option<Vec<Room>> {
        self.inner.socket_rooms(id)
    }

    async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<RemoteSocketData>, AdapterError> {
        self.inner.fetch_sockets(opts).await
    }

    async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.inner.add_sockets(opts, rooms).await;
    }

    async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) {
        self.inner.del_sockets(opts, rooms).await;
    }

    async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) {
        self.inner.disconnect_sockets(opts, close).await;
    }

    async fn server_side_emit(&self, packets: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, AdapterError> {
        self.inner.server_side_emit(packets).await
    }

    fn persist_session(&self, session: SessionToPersist) {
        let client = self.client.clone();
        let manager = self.manager.clone();
        let key = self.session_key(&session.pid);
        let ttl_secs = self.max_disconnection_duration.as_secs().max(1);
        let persisted = PersistedSession {
            sid: session.sid,
            pid: session.pid,
            rooms: session.rooms,
            data: session.data,
            disconnected_at: now_millis(),
        };

        tokio::spawn(async move {
            let payload = match serde_json::to_vec(&persisted) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "failed serializing session for persistence");
                    return;
                }
            };
            let conn = match connection_manager_of(&client, &manager).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, key = %key, "failed obtaining redis connection to persist session");
                    return;
                }
            };
            let mut conn = conn;
            if let Err(e) = conn.set_ex::<_, _, ()>(&key, payload, ttl_secs).await {
                warn!(error = %e, key = %key, "failed persisting session to redis");
            }
        });
    }

    async fn restore_session(&self, pid: &PrivateSessionId, offset: &Offset) -> Result<Option<Session>, AdapterError> {
        use redis::streams::StreamRangeReply;

        if !is_well_formed_offset(offset) {
            return Err(AdapterError::InvalidOffset(offset.as_str().to_owned()));
        }

        let mut conn = self.connection_manager().await.map_err(|e| {
            warn!(error = %e, "redis unavailable, cannot restore session");
            AdapterError::Unsupported("stream session store has no redis connection")
        })?;

        let key = self.session_key(pid);
        let raw: Option<Vec<u8>> = redis::cmd("GETDEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, key = %key, "GETDEL failed");
                AdapterError::Unsupported("stream session store GETDEL failed")
            })?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let persisted: PersistedSession = match serde_json::from_slice(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, key = %key, "failed deserializing persisted session");
                return Ok(None);
            }
        };

        let cutoff = now_millis() - i64_from_duration(self.max_disconnection_duration);
        if persisted.disconnected_at < cutoff {
            return Ok(None);
        }

        let exists: StreamRangeReply = conn
            .xrange_count(&self.stream_name, offset.as_str(), offset.as_str(), 1)
            .await
            .map_err(|e| {
                warn!(error = %e, "xrange existence check failed");
                AdapterError::Unsupported("stream session store xrange failed")
            })?;
        if exists.ids.is_empty() {
            return Ok(None);
        }

        let mut missed_packets = Vec::new();
        let mut cursor = next_offset(offset);
        for _ in 0..self.restore_session_max_xrange_calls {
            let reply: StreamRangeReply = conn
                .xrange_count(&self.stream_name, cursor.as_str(), "+", 1)
                .await
                .map_err(|e| {
                    warn!(error = %e, "xrange replay read failed");
                    AdapterError::Unsupported("stream session store xrange failed")
                })?;
            let Some(entry) = reply.ids.into_iter().next() else {
                break;
            };
            let entry_id = entry.id.clone();
            if let Some(payload) = entry.get::<Vec<u8>>("d") {
                if let Ok(msg) = sio_protocol::codec::decode(&payload) {
                    if msg.nsp == self.nsp {
                        if let MessageBody::Broadcast(data) = msg.body {
                            if should_include_packet(&persisted.rooms, &data.opts) {
                                missed_packets.push(data.packet.data.clone());
                            }
                        }
                    }
                }
            }
            cursor = next_offset(&Offset::from(entry_id));
        }

        Ok(Some(Session {
            sid: persisted.sid,
            pid: persisted.pid,
            rooms: persisted.rooms,
            data: persisted.data,
            missed_packets,
        }))
    }

    fn server_count(&self) -> i64 {
        self.inner.server_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_validation_matches_the_timestamp_sequence_shape() {
        assert!(is_well_formed_offset(&Offset::from("1690000000000-5".to_owned())));
        assert!(!is_well_formed_offset(&Offset::empty()));
        assert!(!is_well_formed_offset(&Offset::from("not-an-offset".to_owned())));
        assert!(!is_well_formed_offset(&Offset::from("123-".to_owned())));
        assert!(!is_well_formed_offset(&Offset::from("-123".to_owned())));
    }
}
