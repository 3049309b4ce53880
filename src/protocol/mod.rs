//! Copilot engine message type definitions.
//!
//! These types model the JSON-RPC parameter and result objects exchanged
//! between this client and the engine. Field names are camelCase on the wire.
//!
//! The module is organized by domain:
//! - [`session`] - session create/resume/send parameters and their config payloads
//! - [`events`] - the `session.event` notification and typed event kinds
//! - [`tools`] - tool definitions, `tool.call` parameters and [`ToolResult`]
//! - [`permissions`] - `permission.request` parameters and decisions
//! - [`status`] - ping, status, auth and model listing

pub mod events;
pub mod permissions;
pub mod session;
pub mod status;
pub mod tools;

/// Protocol version this client speaks; checked against `ping` at start.
pub const SDK_PROTOCOL_VERSION: i64 = 2;

pub use events::{SessionEvent, SessionEventKind, SessionEventParams};
pub use permissions::{PermissionRequest, PermissionRequestParams, PermissionRequestResult};
pub use session::{
    Attachment, AttachmentType, AzureProviderOptions, CustomAgentConfig, DeleteSessionResponse,
    GetLastSessionIdResponse, InfiniteSessionConfig, ListSessionsResponse, McpLocalServerConfig,
    McpRemoteServerConfig, McpServerConfig,
    MessageDeliveryMode, MessageOptions, ProviderConfig, SessionCreateParams,
    SessionCreateResponse, SessionGetMessagesResponse, SessionIdParams, SessionMetadata,
    SessionResumeParams, SessionSendParams, SessionSendResponse, SystemMessageConfig,
    SystemMessageMode,
};
pub use status::{
    GetAuthStatusResponse, GetModelsResponse, GetStatusResponse, ModelBilling,
    ModelCapabilities, ModelInfo, ModelLimits, ModelPolicy, ModelSupports, ModelVisionLimits,
    PingParams, PingResponse,
};
pub use tools::{
    ToolBinaryResult, ToolCallParams, ToolCallResponse, ToolDefinition, ToolResult,
    ToolResultType,
};
