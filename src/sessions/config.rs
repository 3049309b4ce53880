//! Caller-facing session configuration.
//!
//! These mirror the wire parameters of `session.create` / `session.resume`
//! but carry live tool handlers and the permission handler, which never
//! leave the process. Everything else is passed through to the engine
//! untouched.

use std::collections::BTreeMap;
use std::fmt;

use crate::dispatch::{PermissionHandler, Tool, ToolRegistry};
use crate::protocol::{
    CustomAgentConfig, InfiniteSessionConfig, McpServerConfig, ProviderConfig,
    SessionCreateParams, SessionResumeParams, SystemMessageConfig,
};

/// Configuration for [`crate::CopilotClient::create_session`].
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Ask the engine to use this id instead of generating one.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub system_message: Option<SystemMessageConfig>,
    /// Allow-list of built-in tool names.
    pub available_tools: Option<Vec<String>>,
    /// Deny-list of built-in tool names.
    pub excluded_tools: Option<Vec<String>>,
    pub provider: Option<ProviderConfig>,
    /// Emit `*_delta` events while text is generated.
    pub streaming: bool,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub custom_agents: Vec<CustomAgentConfig>,
    pub config_dir: Option<String>,
    pub skill_directories: Vec<String>,
    pub disabled_skills: Vec<String>,
    pub infinite_sessions: Option<InfiniteSessionConfig>,
    /// Caller-implemented tools offered to the engine.
    pub tools: Vec<Tool>,
    pub on_permission_request: Option<PermissionHandler>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_message(mut self, message: SystemMessageConfig) -> Self {
        self.system_message = Some(message);
        self
    }

    pub fn with_available_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.available_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_excluded_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_mcp_server(mut self, name: impl Into<String>, server: McpServerConfig) -> Self {
        self.mcp_servers.insert(name.into(), server);
        self
    }

    pub fn with_custom_agent(mut self, agent: CustomAgentConfig) -> Self {
        self.custom_agents.push(agent);
        self
    }

    pub fn with_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn with_skill_directory(mut self, dir: impl Into<String>) -> Self {
        self.skill_directories.push(dir.into());
        self
    }

    pub fn with_disabled_skill(mut self, name: impl Into<String>) -> Self {
        self.disabled_skills.push(name.into());
        self
    }

    pub fn with_infinite_sessions(mut self, config: InfiniteSessionConfig) -> Self {
        self.infinite_sessions = Some(config);
        self
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_permission_handler(mut self, handler: PermissionHandler) -> Self {
        self.on_permission_request = Some(handler);
        self
    }

    pub(crate) fn tool_registry(&self) -> ToolRegistry {
        ToolRegistry::from_tools(self.tools.iter().cloned())
    }

    /// Wire parameters for `session.create`.
    pub fn to_create_params(&self) -> SessionCreateParams {
        let registry = self.tool_registry();
        SessionCreateParams {
            model: self.model.clone(),
            session_id: self.session_id.clone(),
            tools: non_empty(registry.definitions()),
            system_message: self.system_message.clone(),
            available_tools: self.available_tools.clone(),
            excluded_tools: self.excluded_tools.clone(),
            provider: self.provider.clone(),
            request_permission: self.on_permission_request.as_ref().map(|_| true),
            streaming: self.streaming.then_some(true),
            mcp_servers: non_empty_map(&self.mcp_servers),
            custom_agents: non_empty(self.custom_agents.clone()),
            config_dir: self.config_dir.clone(),
            skill_directories: non_empty(self.skill_directories.clone()),
            disabled_skills: non_empty(self.disabled_skills.clone()),
            infinite_sessions: self.infinite_sessions.clone(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_id", &self.session_id)
            .field("model", &self.model)
            .field("streaming", &self.streaming)
            .field("tools", &self.tools)
            .field("has_permission_handler", &self.on_permission_request.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration for [`crate::CopilotClient::resume_session`].
#[derive(Clone, Default)]
pub struct ResumeSessionConfig {
    pub provider: Option<ProviderConfig>,
    pub streaming: bool,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub custom_agents: Vec<CustomAgentConfig>,
    pub skill_directories: Vec<String>,
    pub disabled_skills: Vec<String>,
    pub tools: Vec<Tool>,
    pub on_permission_request: Option<PermissionHandler>,
}

impl ResumeSessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_mcp_server(mut self, name: impl Into<String>, server: McpServerConfig) -> Self {
        self.mcp_servers.insert(name.into(), server);
        self
    }

    pub fn with_custom_agent(mut self, agent: CustomAgentConfig) -> Self {
        self.custom_agents.push(agent);
        self
    }

    pub fn with_skill_directory(mut self, dir: impl Into<String>) -> Self {
        self.skill_directories.push(dir.into());
        self
    }

    pub fn with_disabled_skill(mut self, name: impl Into<String>) -> Self {
        self.disabled_skills.push(name.into());
        self
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_permission_handler(mut self, handler: PermissionHandler) -> Self {
        self.on_permission_request = Some(handler);
        self
    }

    pub(crate) fn tool_registry(&self) -> ToolRegistry {
        ToolRegistry::from_tools(self.tools.iter().cloned())
    }

    /// Wire parameters for `session.resume`.
    pub fn to_resume_params(&self, session_id: &str) -> SessionResumeParams {
        SessionResumeParams {
            session_id: session_id.to_string(),
            tools: non_empty(self.tool_registry().definitions()),
            provider: self.provider.clone(),
            request_permission: self.on_permission_request.as_ref().map(|_| true),
            streaming: self.streaming.then_some(true),
            mcp_servers: non_empty_map(&self.mcp_servers),
            custom_agents: non_empty(self.custom_agents.clone()),
            skill_directories: non_empty(self.skill_directories.clone()),
            disabled_skills: non_empty(self.disabled_skills.clone()),
        }
    }
}

impl fmt::Debug for ResumeSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeSessionConfig")
            .field("streaming", &self.streaming)
            .field("tools", &self.tools)
            .field("has_permission_handler", &self.on_permission_request.is_some())
            .finish_non_exhaustive()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn non_empty_map<V: Clone>(map: &BTreeMap<String, V>) -> Option<BTreeMap<String, V>> {
    (!map.is_empty()).then(|| map.clone())
}
