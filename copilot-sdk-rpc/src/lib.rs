//! copilot-sdk-rpc: line-delimited JSON-RPC 2.0 plumbing for copilot-sdk.
//!
//! This crate knows nothing about sessions or tools. It moves frames and
//! correlates them:
//!
//! - [`wire`] - JSON-RPC 2.0 message types and standard error codes
//! - [`transport`] - stdio / TCP / in-memory byte channels with newline framing
//! - [`router`] - [`JsonRpcClient`]: id correlation, timeouts, inbound call
//!   and notification dispatch, exactly-once teardown
//! - [`error`] - [`RpcClientError`]
//!
//! # Example
//!
//! ```ignore
//! use copilot_sdk_rpc::{JsonRpcClient, Transport};
//!
//! let transport = Transport::connect_tcp("127.0.0.1", 4321).await?;
//! let client = JsonRpcClient::new(transport);
//! let pong = client.call("ping", Some(serde_json::json!({})), None).await?;
//! ```

pub mod error;
pub mod router;
pub mod transport;
pub mod wire;

pub use error::RpcClientError;
pub use router::{HandlerFuture, JsonRpcClient, NotificationHandler, RequestHandler, request_handler};
pub use transport::{FrameReader, FrameWriter, Transport};
pub use wire::{IncomingMessage, Request, RequestId, Response, RpcError};
