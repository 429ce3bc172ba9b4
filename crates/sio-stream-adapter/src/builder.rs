//! `StreamBuilder`: the shared Redis Streams transport underneath every
//! namespace's [`crate::stream_adapter::StreamAdapter`] (§4.2.4). One
//! builder owns one stream and one background poller; namespaces attach
//! and detach as their `ClusterAdapter`s come and go, and the poller
//! itself runs only while at least one namespace is attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use sio_cluster::{ClusterError, MessageSink};
use sio_protocol::codec::{decode, encode};
use sio_protocol::{ClusterMessage, Offset};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

pub const DEFAULT_STREAM_NAME: &str = "socket.io";
pub const DEFAULT_MAX_LEN: usize = 10_000;
pub const DEFAULT_READ_COUNT: usize = 100;
pub const DEFAULT_READ_BLOCK: Duration = Duration::from_millis(5_000);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Cursor position a fresh poller starts reading from: "only entries
/// appended after I came up", the same semantics Redis gives `XREAD $`.
const TAIL_CURSOR: &str = "$";

pub struct StreamBuilder {
    client: Client,
    stream_name: String,
    max_len: usize,
    read_count: usize,
    read_block: Duration,
    manager: AsyncMutex<Option<ConnectionManager>>,
    namespaces: DashMap<String, Weak<dyn MessageSink>>,
    poller_running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl StreamBuilder {
    #[must_use]
    pub fn new(
        client: Client,
        stream_name: impl Into<String>,
        max_len: usize,
        read_count: usize,
        read_block: Duration,
    ) -> Arc<Self> {
        let stream_name = stream_name.into();
        warn!(stream = %stream_name, "no error handler attached to this bus client; transport errors will only be logged");

        Arc::new(Self {
            client,
            stream_name,
            max_len,
            read_count,
            read_block,
            manager: AsyncMutex::new(None),
            namespaces: DashMap::new(),
            poller_running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        })
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Registers `nsp` as interested in stream entries and starts the
    /// poller if it isn't already running.
    pub fn attach(self: &Arc<Self>, nsp: impl Into<String>, sink: Arc<dyn MessageSink>) {
        self.namespaces.insert(nsp.into(), Arc::downgrade(&sink));
        self.ensure_poller_running();
    }

    /// Unregisters `nsp`. The poller exits on its own once every
    /// namespace has detached.
    pub fn detach(&self, nsp: &str) {
        self.namespaces.remove(nsp);
        if self.namespaces.is_empty() {
            self.shutdown.notify_waiters();
        }
    }

    fn ensure_poller_running(self: &Arc<Self>) {
        if self
            .poller_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let worker = self.clone();
            tokio::spawn(async move {
                worker.run_poller().await;
                worker.poller_running.store(false, Ordering::SeqCst);
            });
        }
    }

    async fn connection_manager(&self) -> Result<ConnectionManager, ClusterError> {
        let mut guard = self.manager.lock().await;
        if let Some(conn) = &*guard {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    pub async fn publish(&self, msg: &ClusterMessage) -> Result<Offset, ClusterError> {
        let payload = encode(msg).map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        let mut conn = self.connection_manager().await?;
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("d")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;
        Ok(Offset::from(id))
    }

    async fn run_poller(self: Arc<Self>) {
        let mut cursor = TAIL_CURSOR.to_owned();
        let mut backoff = INITIAL_BACKOFF;
        info!(stream = %self.stream_name, "stream poller starting");
        loop {
            if self.namespaces.is_empty() {
                info!(stream = %self.stream_name, "stream poller exiting, no namespaces attached");
                return;
            }
            tokio::select! {
                () = self.shutdown.notified() => {
                    if self.namespaces.is_empty() {
                        return;
                    }
                }
                result = self.read_once(&mut cursor) => {
                    match result {
                        Ok(()) => backoff = INITIAL_BACKOFF,
                        Err(e) => {
                            warn!(error = %e, backoff = ?backoff, stream = %self.stream_name, "stream read failed, retrying");
                            tokio::select! {
                                () = self.shutdown.notified() => { if self.namespaces.is_empty() { return; } }
                                () = tokio::time::sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
    }

    async fn read_once(&self, cursor: &mut String) -> Result<(), ClusterError> {
        use redis::streams::{StreamReadOptions, StreamReadReply};

        let mut conn = self.connection_manager().await?;
        let opts = StreamReadOptions::default()
            .count(self.read_count)
            .block(usize::try_from(self.read_block.as_millis()).unwrap_or(usize::MAX));

        let reply: StreamReadReply = conn
            .xread_options(&[self.stream_name.as_str()], &[cursor.as_str()], &opts)
            .await
            .map_err(|e| ClusterError::BusTransportError(e.to_string()))?;

        for key in reply.keys {
            for entry in key.ids {
                *cursor = entry.id.clone();
                let Some(payload) = entry.get::<Vec<u8>>("d") else {
                    continue;
                };
                self.dispatch(&payload).await;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, payload: &[u8]) {
        let msg = match decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, stream = %self.stream_name, "failed decoding cluster message off stream");
                return;
            }
        };
        let Some(sink) = self.namespaces.get(&msg.nsp).and_then(|s| s.value().upgrade()) else {
            debug!(nsp = %msg.nsp, stream = %self.stream_name, "dropping message, namespace not attached");
            return;
        };
        sink.on_message(msg).await;
    }

    /// Current namespace registrations, for tests and diagnostics.
    #[must_use]
    pub fn attached_namespaces(&self) -> HashMap<String, ()> {
        self.namespaces.iter().map(|e| (e.key().clone(), ())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullSink;
    #[async_trait]
    impl MessageSink for NullSink {
        async fn on_message(&self, _msg: ClusterMessage) {}
    }

    fn builder() -> Arc<StreamBuilder> {
        let client = Client::open("redis://127.0.0.1:6399").unwrap();
        StreamBuilder::new(client, DEFAULT_STREAM_NAME, DEFAULT_MAX_LEN, DEFAULT_READ_COUNT, DEFAULT_READ_BLOCK)
    }

    #[tokio::test]
    async fn attach_registers_namespace_and_starts_the_poller() {
        let builder = builder();
        let sink: Arc<dyn MessageSink> = Arc::new(NullSink);
        builder.attach("/", sink);
        assert!(builder.attached_namespaces().contains_key("/"));
        assert!(builder.poller_running.load(Ordering::SeqCst));
        builder.detach("/");
    }

    #[tokio::test]
    async fn attaching_a_second_namespace_does_not_spawn_a_second_poller() {
        let builder = builder();
        let sink_a: Arc<dyn MessageSink> = Arc::new(NullSink);
        let sink_b: Arc<dyn MessageSink> = Arc::new(NullSink);
        builder.attach("/a", sink_a);
        let first = builder.poller_running.load(Ordering::SeqCst);
        builder.attach("/b", sink_b);
        assert!(first);
        assert_eq!(builder.attached_namespaces().len(), 2);
        builder.detach("/a");
        builder.detach("/b");
    }

    #[tokio::test]
    async fn detach_removes_the_namespace() {
        let builder = builder();
        let sink: Arc<dyn MessageSink> = Arc::new(NullSink);
        builder.attach("/chat", sink);
        builder.detach("/chat");
        assert!(!builder.attached_namespaces().contains_key("/chat"));
    }
}
