//! Error kinds for the cluster broadcast protocol (§7).

use sio_protocol::RequestId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("request {0:?} timed out waiting for peer responses")]
    RequestTimeout(RequestId),
    #[error("response for unknown or already-settled request {0:?}")]
    UnknownRequest(RequestId),
    #[error("bus transport error: {0}")]
    BusTransportError(String),
    #[error(transparent)]
    Adapter(#[from] sio_core::AdapterError),
}
