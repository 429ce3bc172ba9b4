//! `BroadcastOptions`: the value every fan-out operation is parameterized by.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::Room;

/// Per-packet flags. `timeout_ms` is carried as milliseconds on the wire
/// (Rust's `Duration` has no stable serde impl); use [`BroadcastFlags::timeout`]
/// / [`BroadcastFlags::set_timeout`] to work with it as a `Duration`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(default)]
    pub volatile: bool,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub expect_single_response: bool,
}

impl BroadcastFlags {
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
    }
}

/// Target/exclusion rooms plus flags for a single fan-out call.
///
/// Empty `rooms` means "every socket in the namespace". `except` is
/// subtracted after `rooms` is resolved, regardless of which came first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastOptions {
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub except: Vec<Room>,
    #[serde(default)]
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.flags.local
    }

    #[must_use]
    pub fn rooms_set(&self) -> HashSet<&Room> {
        self.rooms.iter().collect()
    }

    #[must_use]
    pub fn except_set(&self) -> HashSet<&Room> {
        self.except.iter().collect()
    }
}
