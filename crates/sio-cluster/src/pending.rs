//! `PendingRequest` bookkeeping (§3, §5): the two completion strategies a
//! multi-response request can use, and the response accumulators for the
//! two request kinds that wait across the cluster (`FetchSockets`,
//! `ServerSideEmit`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use sio_core::SharedAck;
use sio_protocol::{RemoteSocketData, ServerId};
use tokio::sync::Notify;

/// How a `PendingRequest` decides it has heard back from everyone it's
/// waiting on. Plain `ClusterAdapter` instances count down from a known
/// peer count (`ServerCount() - 1`); `HeartbeatClusterAdapter` instead
/// tracks the exact set of live peer uids, so a peer's death can complete
/// the request early (§4.2.1).
pub enum Completion {
    Count { expected: i64, current: AtomicI64 },
    MissingUids(Mutex<HashSet<ServerId>>),
}

impl Completion {
    #[must_use]
    pub fn by_count(expected: i64) -> Self {
        Completion::Count { expected, current: AtomicI64::new(0) }
    }

    #[must_use]
    pub fn by_known_peers(peers: HashSet<ServerId>) -> Self {
        Completion::MissingUids(Mutex::new(peers))
    }

    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        match self {
            Completion::Count { expected, current } => current.load(Ordering::SeqCst) >= *expected,
            Completion::MissingUids(missing) => missing.lock().unwrap().is_empty(),
        }
    }

    /// Called once per incoming response for this request.
    pub fn record_response(&self, responder: &ServerId) {
        match self {
            Completion::Count { current, .. } => {
                current.fetch_add(1, Ordering::SeqCst);
            }
            Completion::MissingUids(missing) => {
                missing.lock().unwrap().remove(responder);
            }
        }
    }

    /// Called when a tracked peer is declared dead; only the
    /// `MissingUids` variant reacts (§4.2.1's dead-peer sweep).
    pub fn forget_peer(&self, peer: &ServerId) {
        if let Completion::MissingUids(missing) = self {
            missing.lock().unwrap().remove(peer);
        }
    }

    #[must_use]
    pub fn expected(&self) -> i64 {
        match self {
            Completion::Count { expected, .. } => *expected,
            Completion::MissingUids(missing) => {
                i64::try_from(missing.lock().unwrap().len()).unwrap_or(i64::MAX)
            }
        }
    }

    #[must_use]
    pub fn responded(&self, original_expected: i64) -> i64 {
        match self {
            Completion::Count { current, .. } => current.load(Ordering::SeqCst),
            Completion::MissingUids(missing) => {
                original_expected - i64::try_from(missing.lock().unwrap().len()).unwrap_or(0)
            }
        }
    }
}

/// The two shapes of accumulated response this crate ever waits on.
pub enum CollectedResponses {
    Sockets(Vec<RemoteSocketData>),
    Packets(Vec<serde_json::Value>),
}

pub struct PendingRequest {
    pub completion: Completion,
    pub responses: Mutex<CollectedResponses>,
    pub notify: Arc<Notify>,
}

impl PendingRequest {
    #[must_use]
    pub fn new_sockets(completion: Completion) -> Self {
        Self { completion, responses: Mutex::new(CollectedResponses::Sockets(Vec::new())), notify: Arc::new(Notify::new()) }
    }

    #[must_use]
    pub fn new_packets(completion: Completion) -> Self {
        Self { completion, responses: Mutex::new(CollectedResponses::Packets(Vec::new())), notify: Arc::new(Notify::new()) }
    }

    pub fn push_sockets(&self, responder: &ServerId, mut sockets: Vec<RemoteSocketData>) {
        if let CollectedResponses::Sockets(all) = &mut *self.responses.lock().unwrap() {
            all.append(&mut sockets);
        }
        self.completion.record_response(responder);
        self.notify.notify_waiters();
    }

    pub fn push_packets(&self, responder: &ServerId, mut packets: Vec<serde_json::Value>) {
        if let CollectedResponses::Packets(all) = &mut *self.responses.lock().unwrap() {
            all.append(&mut packets);
        }
        self.completion.record_response(responder);
        self.notify.notify_waiters();
    }

    /// Waits until `completion` is satisfied. Callers race this against a
    /// timeout with `tokio::time::timeout`.
    ///
    /// The `Notified` future is created before the condition is checked so
    /// a response landing between the check and the `.await` still wakes
    /// this waiter, rather than being missed until the external timeout.
    pub async fn wait_until_satisfied(self: &Arc<Self>) {
        loop {
            let notified = self.notify.notified();
            if self.completion.is_satisfied() {
                return;
            }
            notified.await;
        }
    }
}

/// The per-request-id bookkeeping for an outstanding `BroadcastWithAck`
/// published to the cluster: the caller's client-count/ack callbacks,
/// plus how many peer responses are still outstanding for the count.
pub struct AckRequestEntry {
    pub client_count_cb: Mutex<Option<Box<dyn FnOnce(u64) + Send>>>,
    pub ack: SharedAck,
    pub local_count: AtomicI64,
    pub peer_count_total: AtomicI64,
    pub expected_peers: i64,
    pub responded_peers: AtomicI64,
}

impl AckRequestEntry {
    /// Sums the local and every peer's client count, then fires the
    /// caller's callback exactly once. A no-op on the second call.
    pub fn finalize_client_count(&self) {
        let Some(cb) = self.client_count_cb.lock().unwrap().take() else {
            return;
        };
        let total = self.local_count.load(Ordering::SeqCst) + self.peer_count_total.load(Ordering::SeqCst);
        cb(u64::try_from(total).unwrap_or(0));
    }
}
