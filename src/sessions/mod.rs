//! Session multiplexing over one engine connection.
//!
//! [`SessionRegistry`] is the shared table of sessions this client tracks.
//! It is installed on every fresh connection and receives:
//! - `session.event` notifications, fanned out to the owning session
//! - `tool.call` / `tool.invoke` calls, routed to the session's tools
//! - `permission.request` calls, routed to the session's permission handler
//!
//! [`SessionManager`] is the operation surface (create, resume, list,
//! delete, send, abort, ...) used by [`crate::CopilotClient`].

pub mod config;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use copilot_sdk_rpc::{JsonRpcClient, RpcError, request_handler};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::dispatch::{PermissionInvocation, decide_permission, invoke_tool};
use crate::error::{CopilotError, Result, StopError};
use crate::protocol::{
    DeleteSessionResponse, GetLastSessionIdResponse, ListSessionsResponse, MessageOptions,
    PermissionRequestParams, SessionCreateResponse, SessionEvent, SessionEventParams,
    SessionIdParams, SessionMetadata, ToolCallParams, ToolCallResponse,
};
use crate::streaming::{StreamKind, StreamUpdate, StreamingAggregator};
use crate::supervisor::ProcessSupervisor;

pub use config::{ResumeSessionConfig, SessionConfig};
pub use session::{DEFAULT_SEND_AND_WAIT_TIMEOUT, EventListener, Session, Subscription};

use session::SessionState;

const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Sessions tracked by one client, plus the streaming buffers.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionState>>>,
    aggregator: Mutex<StreamingAggregator>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register inbound handlers on a fresh connection.
    pub fn install(self: &Arc<Self>, rpc: &JsonRpcClient) {
        for method in ["tool.call", "tool.invoke"] {
            let registry = Arc::clone(self);
            rpc.register_handler(
                method,
                request_handler(move |params| {
                    let registry = Arc::clone(&registry);
                    async move { registry.handle_tool_call(params).await }
                }),
            );
        }

        let registry = Arc::clone(self);
        rpc.register_handler(
            "permission.request",
            request_handler(move |params| {
                let registry = Arc::clone(&registry);
                async move { registry.handle_permission_request(params).await }
            }),
        );

        let registry = Arc::clone(self);
        rpc.set_notification_handler(Arc::new(move |method: &str, params: Option<Value>| {
            if method == "session.event" {
                registry.dispatch_event(params);
            } else {
                log::debug!("Session: ignoring notification '{method}'");
            }
        }));
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Unfinished streamed text for one session.
    pub fn partial_text(&self, session_id: &str, kind: StreamKind, id: &str) -> Option<String> {
        self.aggregator
            .lock()
            .partial_text(session_id, kind, id)
            .map(str::to_string)
    }

    pub(crate) fn get(&self, session_id: &str) -> Option<Arc<SessionState>> {
        self.sessions.read().get(session_id).cloned()
    }

    fn insert(&self, state: Arc<SessionState>) {
        let previous = self.sessions.write().insert(state.id.clone(), state);
        if let Some(previous) = previous {
            previous.mark_destroyed();
        }
    }

    /// Drop a session locally: end its subscriptions and stream buffers.
    pub(crate) fn forget(&self, session_id: &str) {
        if let Some(state) = self.sessions.write().remove(session_id) {
            state.mark_destroyed();
        }
        self.aggregator.lock().clear_session(session_id);
    }

    /// Remove every session, returning them.
    fn drain(&self) -> Vec<Arc<SessionState>> {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        self.aggregator.lock().clear();
        drained
    }

    /// Route one `session.event` notification. Runs on the reader task, so
    /// listeners see events in arrival order.
    fn dispatch_event(&self, params: Option<Value>) {
        let params: SessionEventParams = match parse_params(params) {
            Ok(params) => params,
            Err(err) => {
                log::warn!("Session: dropping malformed session.event: {}", err.message);
                return;
            }
        };
        let Some(state) = self.get(&params.session_id) else {
            log::debug!(
                "Session: dropping '{}' for untracked session {}",
                params.event.event_type,
                params.session_id
            );
            return;
        };

        let update = self.aggregator.lock().observe(&state.id, &params.event);
        if let StreamUpdate::Partial { id, text, .. } = &update {
            log::trace!("Session: {} stream {id}: {} byte(s) so far", state.id, text.len());
        }
        state.deliver(params.event);
    }

    async fn handle_tool_call(&self, params: Option<Value>) -> std::result::Result<Value, RpcError> {
        let params: ToolCallParams = parse_params(params)?;
        let Some(state) = self.get(&params.session_id) else {
            return Err(RpcError::invalid_params(format!(
                "unknown session {}",
                params.session_id
            )));
        };
        let tool = state.tools.read().get(&params.tool_name).cloned();
        let result = invoke_tool(tool, params.into()).await;
        serde_json::to_value(ToolCallResponse { result }).map_err(RpcError::internal)
    }

    async fn handle_permission_request(
        &self,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError> {
        let params: PermissionRequestParams = parse_params(params)?;
        let handler = match self.get(&params.session_id) {
            Some(state) => state.permission_handler.read().clone(),
            None => {
                log::warn!(
                    "Permission: request for untracked session {}; denying",
                    params.session_id
                );
                None
            }
        };
        let decision = decide_permission(
            handler,
            params.permission_request,
            PermissionInvocation {
                session_id: params.session_id,
            },
        )
        .await;
        Ok(serde_json::json!({ "result": decision }))
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(RpcError::invalid_params)
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ManagerInner {
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<SessionRegistry>,
}

/// Session operations against the supervised engine.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(supervisor: Arc<ProcessSupervisor>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                supervisor,
                registry,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Live connection, starting the engine if allowed.
    pub(crate) async fn rpc(&self) -> Result<Arc<JsonRpcClient>> {
        self.inner.supervisor.ensure_started().await
    }

    /// Live connection without starting anything.
    pub(crate) fn connected_rpc(&self) -> Option<Arc<JsonRpcClient>> {
        self.inner.supervisor.rpc()
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let rpc = self.rpc().await?;
        let value = rpc.call(method, Some(params), None).await?;
        decode(method, value)
    }

    fn lookup(&self, session_id: &str) -> Result<Session> {
        self.get(session_id)
            .ok_or_else(|| CopilotError::SessionNotFound(session_id.to_string()))
    }

    /// Create a session. Concurrent calls share a single engine start.
    pub async fn create_session(&self, config: SessionConfig) -> Result<Session> {
        let params = serde_json::to_value(config.to_create_params())?;
        let response: SessionCreateResponse = self.call("session.create", params).await?;
        log::info!("Session: created {}", response.session_id);

        let state = Arc::new(SessionState::new(
            response.session_id,
            response.workspace_path,
            config.tool_registry(),
            config.on_permission_request.clone(),
            config.streaming,
        ));
        self.inner.registry.insert(Arc::clone(&state));
        Ok(Session::new(state, self.clone()))
    }

    /// Resume a session the engine knows about, possibly created by another
    /// client. History observed before the resume is not synthesized.
    pub async fn resume_session(
        &self,
        session_id: &str,
        config: ResumeSessionConfig,
    ) -> Result<Session> {
        let params = serde_json::to_value(config.to_resume_params(session_id))?;
        let rpc = self.rpc().await?;
        let value = rpc
            .call("session.resume", Some(params), None)
            .await
            .map_err(|e| CopilotError::from(e).for_session(session_id))?;
        let response: SessionCreateResponse = decode("session.resume", value)?;
        log::info!("Session: resumed {}", response.session_id);

        let tools = config.tool_registry();
        let handler = config.on_permission_request.clone();
        let state = match self.inner.registry.get(&response.session_id) {
            Some(existing) => {
                existing.reconfigure(response.workspace_path, tools, handler, config.streaming);
                existing
            }
            None => {
                let state = Arc::new(SessionState::new(
                    response.session_id,
                    response.workspace_path,
                    tools,
                    handler,
                    config.streaming,
                ));
                self.inner.registry.insert(Arc::clone(&state));
                state
            }
        };
        Ok(Session::new(state, self.clone()))
    }

    /// Sessions the engine has persisted.
    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>> {
        let response: ListSessionsResponse =
            self.call("session.list", serde_json::json!({})).await?;
        Ok(response.sessions)
    }

    /// Permanently delete a session's persisted state on the engine.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let params = serde_json::to_value(SessionIdParams::new(session_id))?;
        let outcome = match self.call::<DeleteSessionResponse>("session.delete", params).await {
            Ok(response) if response.success => Ok(()),
            Ok(response) => {
                let reason = response.error.unwrap_or_else(|| "unknown error".to_string());
                if reason.to_ascii_lowercase().contains("not found") {
                    Err(CopilotError::SessionNotFound(session_id.to_string()))
                } else {
                    Err(CopilotError::Session(format!(
                        "Failed to delete session {session_id}: {reason}"
                    )))
                }
            }
            Err(err) => Err(err.for_session(session_id)),
        };

        // The local handle stays usable unless the engine no longer has it.
        match &outcome {
            Ok(()) => {
                log::info!("Session: deleted {session_id}");
                self.inner.registry.forget(session_id);
            }
            Err(CopilotError::SessionNotFound(_)) => self.inner.registry.forget(session_id),
            Err(err) => log::warn!("Session: delete of {session_id} failed: {err}"),
        }
        outcome
    }

    /// Most recently updated session id, if the engine has any.
    pub async fn get_last_session_id(&self) -> Result<Option<String>> {
        let response: GetLastSessionIdResponse =
            self.call("session.getLastId", serde_json::json!({})).await?;
        Ok(response.session_id)
    }

    /// Handle for a tracked session.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner
            .registry
            .get(session_id)
            .map(|state| Session::new(state, self.clone()))
    }

    pub async fn send(&self, session_id: &str, options: impl Into<MessageOptions>) -> Result<String> {
        self.lookup(session_id)?.send(options).await
    }

    pub async fn abort(&self, session_id: &str) -> Result<()> {
        self.lookup(session_id)?.abort().await
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        self.lookup(session_id)?.get_messages().await
    }

    pub fn on<F>(&self, session_id: &str, listener: F) -> Result<Subscription>
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        Ok(self.lookup(session_id)?.on(listener))
    }

    /// Destroy every tracked session on the engine (when connected) and
    /// forget them all, collecting failures.
    pub async fn destroy_all(&self) -> Vec<StopError> {
        let sessions = self.inner.registry.drain();
        let rpc = self.connected_rpc();
        let mut errors = Vec::new();

        for state in sessions {
            state.mark_destroyed();
            let Some(rpc) = rpc.as_ref() else { continue };
            let params = match serde_json::to_value(SessionIdParams::new(&state.id)) {
                Ok(params) => params,
                Err(e) => {
                    errors.push(StopError::new(format!(
                        "Failed to destroy session {}: {e}",
                        state.id
                    )));
                    continue;
                }
            };
            if let Err(err) = rpc
                .call("session.destroy", Some(params), Some(DESTROY_TIMEOUT))
                .await
            {
                errors.push(StopError::new(format!(
                    "Failed to destroy session {}: {err}",
                    state.id
                )));
            }
        }
        errors
    }

    /// Forget every session without contacting the engine.
    pub fn clear(&self) {
        for state in self.inner.registry.drain() {
            state.mark_destroyed();
        }
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| CopilotError::Protocol(format!("invalid '{method}' response: {e}")))
}
