//! Error type for calls issued through [`crate::JsonRpcClient`].

use std::time::Duration;

use thiserror::Error;

use crate::wire::RpcError;

/// Failure of an outgoing call or notification.
#[derive(Debug, Error)]
pub enum RpcClientError {
    /// The transport closed (engine exited, socket dropped, or the client was
    /// shut down) before a response arrived.
    #[error("connection lost")]
    ConnectionLost,

    /// The per-call deadline elapsed before a matching response arrived.
    #[error("request '{method}' timed out after {}ms", .timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    /// The engine answered with a JSON-RPC error object.
    #[error(transparent)]
    Remote(#[from] RpcError),

    /// Writing to the transport failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The outgoing message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RpcClientError {
    /// The remote error object, when the engine replied with one.
    pub fn as_remote(&self) -> Option<&RpcError> {
        match self {
            RpcClientError::Remote(err) => Some(err),
            _ => None,
        }
    }
}
