//! Bridges server-initiated calls to caller-supplied handlers.
//!
//! - [`tools`] - tool registrations and `tool.call` / `tool.invoke`
//! - [`permissions`] - `permission.request` decisions
//!
//! Handlers are looked up per session at dispatch time; see
//! [`crate::sessions`] for where the RPC methods are wired in.

pub mod permissions;
pub mod tools;

pub use permissions::{
    PermissionFuture, PermissionHandler, PermissionInvocation, approve_all, decide_permission,
    permission_handler,
};
pub use tools::{
    HandlerError, Tool, ToolFuture, ToolHandler, ToolInvocation, ToolOutput, ToolRegistry,
    invoke_tool,
};
