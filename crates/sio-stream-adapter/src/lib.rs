//! Redis Streams transport for `sio-cluster`'s `Bus` trait, plus the
//! stream-backed session store (§4.2.4, §4.3).

pub mod builder;
pub mod session_store;
pub mod stream_adapter;

pub use builder::{StreamBuilder, DEFAULT_MAX_LEN, DEFAULT_READ_BLOCK, DEFAULT_READ_COUNT, DEFAULT_STREAM_NAME};
pub use session_store::{StreamSessionStore, DEFAULT_RESTORE_SESSION_MAX_XRANGE_CALLS, DEFAULT_SESSION_KEY_PREFIX};
pub use stream_adapter::StreamAdapter;
