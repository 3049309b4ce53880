//! Client library for the GitHub Copilot CLI agent engine.
//!
//! The engine is a separate process reached over JSON-RPC 2.0, either on its
//! stdin/stdout or on a TCP socket. This crate manages the process, carries
//! the connection, multiplexes sessions over it, and answers the engine's
//! tool and permission callbacks with caller-supplied handlers.
//!
//! # Modules
//!
//! - [`client`] - [`CopilotClient`], the entry point
//! - [`options`] - [`ClientOptions`] and address validation
//! - [`supervisor`] - process lifecycle and connection state machine
//! - [`sessions`] - session registry, [`Session`] handles, configs
//! - [`dispatch`] - tool and permission callback bridging
//! - [`streaming`] - delta reassembly for streamed text
//! - [`protocol`] - wire types
//! - [`harness`] - helpers for the bundled harness binary
//!
//! # Lock usage
//!
//!   - `parking_lot::{Mutex, RwLock}` - sync state touched from the
//!     connection reader (session table, listeners, stream buffers).
//!   - `tokio::sync::Mutex` - state held across `.await` (start attempts,
//!     per-session sends, the frame writer, the model cache).

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod client;
pub mod dispatch;
pub mod error;
pub mod harness;
pub mod options;
pub mod protocol;
pub mod sessions;
pub mod streaming;
pub mod supervisor;

pub use copilot_sdk_rpc as rpc;

pub use client::CopilotClient;
pub use dispatch::{
    HandlerError, PermissionHandler, PermissionInvocation, Tool, ToolInvocation, ToolOutput,
    ToolRegistry, approve_all, permission_handler,
};
pub use error::{CopilotError, Result, StopError};
pub use options::{ClientOptions, LogLevel, ServerEndpoint};
pub use protocol::{
    Attachment, MessageDeliveryMode, MessageOptions, PermissionRequest, PermissionRequestResult,
    SessionEvent, SessionEventKind, SessionMetadata, SystemMessageConfig, ToolResult,
    ToolResultType,
};
pub use sessions::{ResumeSessionConfig, Session, SessionConfig, SessionManager, Subscription};
pub use streaming::{StreamKind, StreamUpdate, StreamingAggregator};
pub use supervisor::ConnectionState;
