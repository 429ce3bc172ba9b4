//! Opaque identifiers shared across the cluster wire protocol.
//!
//! All of these are plain strings on the wire; the newtypes exist so a
//! `SocketId` can never be handed somewhere a `Room` is expected, etc.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

opaque_id!(SocketId);
opaque_id!(PrivateSessionId);
opaque_id!(ServerId);
opaque_id!(Room);
opaque_id!(RequestId);

/// Reserved `ServerId` for one-way publishers that never receive responses.
pub const EMITTER_UID: &str = "emitter";

impl ServerId {
    #[must_use]
    pub fn is_emitter(&self) -> bool {
        self.0 == EMITTER_UID
    }
}

/// Per-broadcast position marker. Empty for adapters that don't order
/// packets (only the stream adapter produces non-empty offsets); for the
/// stream adapter it's a Redis-stream-style `"timestamp-sequence"` id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(pub String);

impl Offset {
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Offset {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Advances a `"timestamp-sequence"` offset to the next sequence number.
///
/// Returns the input unchanged when it doesn't match the expected shape --
/// this is used as the starting point for the stream session store's
/// bounded range-read replay, where an unparseable offset simply means
/// "start here" rather than an error.
#[must_use]
pub fn next_offset(offset: &Offset) -> Offset {
    let Some((ts, seq)) = offset.0.split_once('-') else {
        return offset.clone();
    };
    let Ok(seq) = seq.parse::<u64>() else {
        return offset.clone();
    };
    Offset(format!("{ts}-{}", seq + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_offset_increments_sequence_component() {
        assert_eq!(next_offset(&Offset::from("1690000000000-5".to_owned())).0, "1690000000000-6");
    }

    #[test]
    fn next_offset_is_identity_on_unrecognized_format() {
        let weird = Offset::from("not-an-offset-at-all".to_owned());
        // "not-an-offset-at-all" splits at first '-' into "not" / "an-offset-at-all",
        // whose tail doesn't parse as a plain integer.
        assert_eq!(next_offset(&weird), weird);

        let empty = Offset::empty();
        assert_eq!(next_offset(&empty), empty);
    }

    #[test]
    fn ids_roundtrip_through_json() {
        let id = SocketId::new("abc123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc123\"");
        let back: SocketId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
