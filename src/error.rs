//! Typed error types for copilot-sdk.
//!
//! Callers at the crate boundary can match on specific variants instead of
//! parsing strings:
//! - configuration problems, detected synchronously at construction
//! - connection problems (spawn, socket, unexpected exit)
//! - session-scoped failures (unknown session, engine-reported turn errors)
//! - per-call timeouts and remote error replies

use std::time::Duration;

use copilot_sdk_rpc::wire::{INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
use copilot_sdk_rpc::{RpcClientError, RpcError};
use thiserror::Error;

/// Top-level error type for the Copilot client.
#[derive(Debug, Error)]
pub enum CopilotError {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------
    /// Invalid address form, out-of-range port, or conflicting options.
    /// The message is stable and names the offending value.
    #[error("{0}")]
    Configuration(String),

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------
    /// The engine could not be spawned or reached, or exited during start.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection closed while a call was pending.
    #[error("Connection lost")]
    ConnectionLost,

    /// The client is not connected and `auto_start` is disabled.
    #[error("Client not connected. Call start() first.")]
    NotConnected,

    /// The engine speaks a different protocol version.
    #[error(
        "SDK protocol version mismatch: SDK expects version {expected}, but server reports {}",
        .actual.map(|v| v.to_string()).unwrap_or_else(|| "no version".to_string())
    )]
    ProtocolVersionMismatch { expected: i64, actual: Option<i64> },

    /// A reply or event could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------
    /// The engine has no record of the session (or it was destroyed locally).
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The per-call deadline elapsed before a response arrived.
    #[error("'{method}' timed out after {}ms", .timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    /// The engine answered a call with a JSON-RPC error object.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The engine reported a `session.error` event for the awaited turn.
    #[error("Session error: {0}")]
    Session(String),

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RpcClientError> for CopilotError {
    fn from(err: RpcClientError) -> Self {
        match err {
            RpcClientError::ConnectionLost => CopilotError::ConnectionLost,
            RpcClientError::Timeout { method, timeout } => CopilotError::Timeout { method, timeout },
            RpcClientError::Remote(rpc) => CopilotError::Rpc(rpc),
            RpcClientError::Io(io) => CopilotError::Io(io),
            RpcClientError::Encode(e) => CopilotError::Serialization(e),
        }
    }
}

impl CopilotError {
    /// Whether this error means the connection to the engine is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, CopilotError::ConnectionLost)
    }

    /// Re-classify an engine error reply to a session-scoped call.
    ///
    /// The engine has no dedicated error code for unknown sessions; an
    /// application-level error whose message mentions "not found" is mapped
    /// to [`CopilotError::SessionNotFound`]. Protocol-level codes (an
    /// unimplemented method, a malformed request) are left alone.
    pub(crate) fn for_session(self, session_id: &str) -> Self {
        match self {
            CopilotError::Rpc(ref rpc)
                if !is_protocol_code(rpc.code)
                    && rpc.message.to_ascii_lowercase().contains("not found") =>
            {
                CopilotError::SessionNotFound(session_id.to_string())
            }
            other => other,
        }
    }
}

fn is_protocol_code(code: i64) -> bool {
    matches!(code, PARSE_ERROR | INVALID_REQUEST | METHOD_NOT_FOUND)
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CopilotError>;

/// A cleanup failure collected by [`crate::CopilotClient::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopError {
    pub message: String,
}

impl StopError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
