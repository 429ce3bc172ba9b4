//! Error kinds for the in-process adapter boundary (§7).
//!
//! Only programmer error (`ReservedEvent`, `Unsupported`) and an explicit
//! `InvalidOffset` are ever returned from here; everything recoverable is
//! absorbed and logged at the call site per the error-handling design.

use sio_protocol::RemoteSocketData;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    #[error("operation unsupported by this adapter: {0}")]
    Unsupported(&'static str),
    #[error("cannot emit reserved event {0:?}")]
    ReservedEvent(String),
    #[error("invalid session offset {0:?}")]
    InvalidOffset(String),
    /// `FetchSockets` across the cluster timed out before every peer
    /// answered. Carries what was collected so far -- the caller gets
    /// both the partial results and the fact that they're partial.
    #[error("only {responded} of {expected} fetch_sockets responses received")]
    PartialFetchSockets {
        responses: Vec<RemoteSocketData>,
        responded: i64,
        expected: i64,
    },
}

/// Error handed to an ack callback when it can't be satisfied normally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("ack timed out waiting for {responded}/{expected} responses")]
    Timeout { responded: u64, expected: u64 },
    #[error("cannot emit reserved event {0:?}")]
    ReservedEvent(String),
}
