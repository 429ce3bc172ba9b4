//! `BroadcastOperator`: the immutable fluent builder namespace-level
//! helpers return (§4.4). Each chaining method returns a new operator;
//! the receiver is left untouched.

use std::sync::Arc;
use std::time::Duration;

use sio_protocol::{BroadcastOptions, Packet, Room};
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout as tokio_timeout;

use crate::adapter::Adapter;
use crate::error::{AckError, AdapterError};
use crate::socket::SharedAck;

/// Reserved event names that can never be emitted through the operator.
const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

#[derive(Clone)]
pub struct BroadcastOperator {
    adapter: Arc<dyn Adapter>,
    opts: BroadcastOptions,
}

impl BroadcastOperator {
    #[must_use]
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self { adapter, opts: BroadcastOptions::default() }
    }

    #[must_use]
    pub fn to(&self, room: impl Into<Room>) -> Self {
        let mut opts = self.opts.clone();
        opts.rooms.push(room.into());
        Self { adapter: self.adapter.clone(), opts }
    }

    /// Alias for `to` -- socket.io distinguishes `In`/`To` only by intent,
    /// not behavior.
    #[must_use]
    pub fn in_(&self, room: impl Into<Room>) -> Self {
        self.to(room)
    }

    #[must_use]
    pub fn except(&self, room: impl Into<Room>) -> Self {
        let mut opts = self.opts.clone();
        opts.except.push(room.into());
        Self { adapter: self.adapter.clone(), opts }
    }

    #[must_use]
    pub fn compress(&self, compress: bool) -> Self {
        let mut opts = self.opts.clone();
        opts.flags.compress = Some(compress);
        Self { adapter: self.adapter.clone(), opts }
    }

    #[must_use]
    pub fn volatile(&self) -> Self {
        let mut opts = self.opts.clone();
        opts.flags.volatile = true;
        Self { adapter: self.adapter.clone(), opts }
    }

    #[must_use]
    pub fn local(&self) -> Self {
        let mut opts = self.opts.clone();
        opts.flags.local = true;
        Self { adapter: self.adapter.clone(), opts }
    }

    #[must_use]
    pub fn timeout(&self, timeout: Duration) -> Self {
        let mut opts = self.opts.clone();
        opts.flags.set_timeout(timeout);
        Self { adapter: self.adapter.clone(), opts }
    }

    /// Delivers the first response slice instead of the aggregated slice;
    /// used by per-socket emits where exactly one reply is expected.
    #[must_use]
    pub fn expect_single_response(&self) -> Self {
        let mut opts = self.opts.clone();
        opts.flags.expect_single_response = true;
        Self { adapter: self.adapter.clone(), opts }
    }

    #[must_use]
    pub fn options(&self) -> &BroadcastOptions {
        &self.opts
    }

    /// Fire-and-forget emit: no ack expected.
    pub async fn emit(&self, event: &str, args: Vec<serde_json::Value>) -> Result<(), AdapterError> {
        if RESERVED_EVENTS.contains(&event) {
            return Err(AdapterError::ReservedEvent(event.to_owned()));
        }
        let mut data = vec![serde_json::Value::String(event.to_owned())];
        data.extend(args);
        let packet = Packet {
            ty: sio_protocol::PacketType::Event,
            nsp: String::new(),
            id: None,
            data: serde_json::Value::Array(data),
        };
        self.adapter.broadcast(packet, self.opts.clone()).await
    }

    /// Emit with an ack callback. Resolves when every expected client (and,
    /// for cluster adapters, every expected server) has answered, or when
    /// `opts.flags.timeout` elapses -- whichever comes first. When
    /// `expect_single_response` is set, the first response slice is
    /// delivered instead of the full aggregate.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<Vec<serde_json::Value>, AckError> {
        if RESERVED_EVENTS.contains(&event) {
            return Err(AckError::ReservedEvent(event.to_owned()));
        }
        let mut data = vec![serde_json::Value::String(event.to_owned())];
        data.extend(args);
        let packet = Packet {
            ty: sio_protocol::PacketType::Event,
            nsp: String::new(),
            id: None,
            data: serde_json::Value::Array(data),
        };

        let expect_single = self.opts.flags.expect_single_response;
        let wait = self.opts.flags.timeout().unwrap_or(Duration::from_millis(5_000));

        let (client_count_tx, client_count_rx) = oneshot::channel::<u64>();
        let responses: Arc<std::sync::Mutex<Vec<serde_json::Value>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());

        let responses_for_ack = responses.clone();
        let notify_for_ack = notify.clone();
        let ack: SharedAck = Arc::new(move |args, _err| {
            let mut guard = responses_for_ack.lock().unwrap();
            if !expect_single || guard.is_empty() {
                guard.push(serde_json::Value::Array(args));
            }
            drop(guard);
            notify_for_ack.notify_waiters();
        });

        let client_count_cb = Box::new(move |n: u64| {
            let _ = client_count_tx.send(n);
        });

        self.adapter
            .broadcast_with_ack(packet, self.opts.clone(), client_count_cb, ack)
            .await
            .map_err(|_| AckError::Timeout { responded: 0, expected: 0 })?;

        let expected = client_count_rx.await.unwrap_or(0);

        let wait_for_completion = async {
            loop {
                let notified = notify.notified();
                let satisfied = if expect_single {
                    !responses.lock().unwrap().is_empty()
                } else {
                    responses.lock().unwrap().len() as u64 >= expected
                };
                if satisfied {
                    return;
                }
                notified.await;
            }
        };

        let timed_out = tokio_timeout(wait, wait_for_completion).await.is_err();

        let collected = responses.lock().unwrap().clone();
        if timed_out {
            return Err(AckError::Timeout { responded: collected.len() as u64, expected });
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalAdapter;
    use crate::socket::{AckFn, EncodedFrames, Handshake, NamespaceSockets, PacketEncoder, Socket, WriteOptions};
    use dashmap::DashMap;
    use sio_protocol::SocketId;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeEncoder;
    impl PacketEncoder for FakeEncoder {
        fn encode(&self, packet: &Packet, _binary: bool) -> EncodedFrames {
            Arc::new(vec![serde_json::to_vec(&packet.data).unwrap()])
        }
    }

    struct RepliesImmediately {
        id: SocketId,
    }
    impl Socket for RepliesImmediately {
        fn id(&self) -> &SocketId {
            &self.id
        }
        fn handshake(&self) -> &Handshake {
            static H: std::sync::OnceLock<Handshake> = std::sync::OnceLock::new();
            H.get_or_init(Handshake::default)
        }
        fn data(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn write_to_engine(&self, _frames: EncodedFrames, _opts: WriteOptions) {}
        fn register_ack(&self, _packet_id: u64, ack: AckFn) {
            ack(vec![serde_json::json!("ok")], None);
        }
        fn notify_outgoing_listeners(&self, _packet: &Packet) {}
    }

    struct FakeNamespace {
        sockets: DashMap<SocketId, Arc<dyn Socket>>,
        next_id: AtomicU64,
    }
    impl NamespaceSockets for FakeNamespace {
        fn name(&self) -> &str {
            "/"
        }
        fn get_socket(&self, id: &SocketId) -> Option<Arc<dyn Socket>> {
            self.sockets.get(id).map(|s| s.clone())
        }
        fn next_packet_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn adapter_with_clients(n: usize) -> Arc<dyn Adapter> {
        let sockets = DashMap::new();
        for i in 0..n {
            let id = SocketId::new(format!("s{i}"));
            sockets.insert(id.clone(), Arc::new(RepliesImmediately { id }) as Arc<dyn Socket>);
        }
        let ns = Arc::new(FakeNamespace { sockets, next_id: AtomicU64::new(1) });
        let local = LocalAdapter::new(ns.clone(), Arc::new(FakeEncoder));
        for i in 0..n {
            local.add_all(SocketId::new(format!("s{i}")), vec![Room::new("R")]);
        }
        Arc::new(local)
    }

    #[tokio::test]
    async fn reserved_events_are_rejected_synchronously() {
        let adapter = adapter_with_clients(0);
        let op = BroadcastOperator::new(adapter);
        let err = op.emit("connect", vec![]).await.unwrap_err();
        assert!(matches!(err, AdapterError::ReservedEvent(_)));
    }

    #[tokio::test]
    async fn emit_with_ack_rejects_reserved_events_synchronously() {
        let adapter = adapter_with_clients(0);
        let op = BroadcastOperator::new(adapter);
        let err = op.emit_with_ack("disconnect", vec![]).await.unwrap_err();
        assert!(matches!(err, AckError::ReservedEvent(_)));
    }

    #[tokio::test]
    async fn chaining_methods_do_not_mutate_the_receiver() {
        let adapter = adapter_with_clients(0);
        let base = BroadcastOperator::new(adapter);
        let scoped = base.to("room-a").volatile();
        assert!(base.options().rooms.is_empty());
        assert!(!base.options().flags.volatile);
        assert_eq!(scoped.options().rooms, vec![Room::new("room-a")]);
        assert!(scoped.options().flags.volatile);
    }

    #[tokio::test]
    async fn emit_with_ack_aggregates_every_client_reply() {
        let adapter = adapter_with_clients(3);
        let op = BroadcastOperator::new(adapter).to("R").timeout(Duration::from_millis(200));
        let responses = op.emit_with_ack("ping", vec![]).await.unwrap();
        assert_eq!(responses.len(), 3);
    }

    #[tokio::test]
    async fn emit_with_ack_times_out_when_nobody_replies() {
        struct NeverReplies {
            id: SocketId,
        }
        impl Socket for NeverReplies {
            fn id(&self) -> &SocketId {
                &self.id
            }
            fn handshake(&self) -> &Handshake {
                static H: std::sync::OnceLock<Handshake> = std::sync::OnceLock::new();
                H.get_or_init(Handshake::default)
            }
            fn data(&self) -> serde_json::Value {
                serde_json::Value::Null
            }
            fn write_to_engine(&self, _frames: EncodedFrames, _opts: WriteOptions) {}
            fn register_ack(&self, _packet_id: u64, _ack: AckFn) {
                // Dropped on the floor -- simulates a client that never replies.
            }
            fn notify_outgoing_listeners(&self, _packet: &Packet) {}
        }

        let sockets = DashMap::new();
        let id = SocketId::new("s0");
        sockets.insert(id.clone(), Arc::new(NeverReplies { id }) as Arc<dyn Socket>);
        let ns = Arc::new(FakeNamespace { sockets, next_id: AtomicU64::new(1) });
        let local = LocalAdapter::new(ns.clone(), Arc::new(FakeEncoder));
        local.add_all(SocketId::new("s0"), vec![Room::new("R")]);
        let adapter: Arc<dyn Adapter> = Arc::new(local);

        let op = BroadcastOperator::new(adapter).to("R").timeout(Duration::from_millis(50));
        let err = op.emit_with_ack("ping", vec![]).await.unwrap_err();
        assert!(matches!(err, AckError::Timeout { responded: 0, expected: 1 }));
    }

    #[test]
    fn reserved_event_list_matches_spec() {
        for ev in ["connect", "connect_error", "disconnect", "disconnecting", "newListener", "removeListener"] {
            assert!(RESERVED_EVENTS.contains(&ev));
        }
    }

    // Silence an unused-import warning when the Mutex import above isn't
    // otherwise referenced directly by name.
    #[allow(dead_code)]
    fn _touch(_: &StdMutex<()>) {}
}
