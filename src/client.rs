//! `CopilotClient`: the public entry point.
//!
//! Wires [`ProcessSupervisor`], [`SessionRegistry`] and [`SessionManager`]
//! together and exposes the engine's client-side methods.
//!
//! ```ignore
//! let client = CopilotClient::new(ClientOptions::new())?;
//! let session = client
//!     .create_session(SessionConfig::new().with_model("gpt-5").with_streaming(true))
//!     .await?;
//! let answer = session.send_and_wait("What is 2 + 2?", None).await?;
//! client.stop().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use copilot_sdk_rpc::JsonRpcClient;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{CopilotError, Result, StopError};
use crate::options::{ClientOptions, ServerEndpoint};
use crate::protocol::{
    GetAuthStatusResponse, GetModelsResponse, GetStatusResponse, ModelInfo, PingParams,
    PingResponse, SessionMetadata,
};
use crate::sessions::{
    ResumeSessionConfig, Session, SessionConfig, SessionManager, SessionRegistry,
};
use crate::supervisor::{ConnectionSetup, ConnectionState, ProcessSupervisor};

/// Client for one Copilot engine.
///
/// Independent clients may coexist in one process; nothing here is global.
pub struct CopilotClient {
    supervisor: Arc<ProcessSupervisor>,
    sessions: SessionManager,
    models: tokio::sync::Mutex<Option<Vec<ModelInfo>>>,
}

impl CopilotClient {
    /// Validate `options` and build a client. Nothing is spawned until the
    /// first operation (or [`Self::start`]).
    pub fn new(options: ClientOptions) -> Result<Self> {
        let endpoint = options.resolve()?;
        let registry = Arc::new(SessionRegistry::new());

        let installer = Arc::clone(&registry);
        let setup: ConnectionSetup = Arc::new(move |rpc: &JsonRpcClient| installer.install(rpc));
        let supervisor = Arc::new(ProcessSupervisor::new(options, endpoint, setup));
        let sessions = SessionManager::new(Arc::clone(&supervisor), registry);

        Ok(Self {
            supervisor,
            sessions,
            models: tokio::sync::Mutex::new(None),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        self.supervisor.options()
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        self.supervisor.endpoint()
    }

    /// Whether the engine is reached through `cli_url` rather than spawned.
    pub fn is_external_server(&self) -> bool {
        self.supervisor.endpoint().is_external()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe()
    }

    /// Why the last start failed or the engine went away.
    pub fn last_error(&self) -> Option<String> {
        self.supervisor.last_error()
    }

    /// Engine processes spawned (or external connections opened) so far.
    pub fn launch_count(&self) -> u64 {
        self.supervisor.launch_count()
    }

    /// Session operations, including ones addressed by id.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the engine and complete the handshake. Idempotent.
    pub async fn start(&self) -> Result<()> {
        self.supervisor.start().await.map(|_| ())
    }

    /// Destroy every session, close the connection and stop the engine.
    ///
    /// Cleanup keeps going past failures; they are returned rather than
    /// raised.
    pub async fn stop(&self) -> Vec<StopError> {
        let mut errors = self.sessions.destroy_all().await;
        errors.extend(self.supervisor.stop().await);
        *self.models.lock().await = None;
        for error in &errors {
            log::warn!("Client: stop: {}", error.message);
        }
        errors
    }

    /// Tear everything down without talking to the engine. Safe to call any
    /// number of times, from any state.
    pub async fn force_stop(&self) {
        self.sessions.clear();
        self.supervisor.force_stop().await;
        *self.models.lock().await = None;
    }

    /// Recover from `Error` (or refresh a healthy connection).
    pub async fn restart(&self) -> Result<()> {
        self.sessions.clear();
        *self.models.lock().await = None;
        self.supervisor.restart().await.map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Engine methods
    // -----------------------------------------------------------------------

    /// Issue any client method. Starts the engine if allowed.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let rpc = self.supervisor.ensure_started().await?;
        Ok(rpc.call(method, Some(params), timeout).await?)
    }

    async fn request_typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.request(method, params, None).await?;
        serde_json::from_value(value)
            .map_err(|e| CopilotError::Protocol(format!("invalid '{method}' response: {e}")))
    }

    pub async fn ping(&self, message: Option<&str>) -> Result<PingResponse> {
        let params = PingParams {
            message: message.map(str::to_string),
        };
        self.request_typed("ping", serde_json::to_value(params)?).await
    }

    pub async fn get_status(&self) -> Result<GetStatusResponse> {
        self.request_typed("status.get", serde_json::json!({})).await
    }

    pub async fn get_auth_status(&self) -> Result<GetAuthStatusResponse> {
        self.request_typed("auth.getStatus", serde_json::json!({})).await
    }

    /// Available models. Cached after the first successful call until the
    /// client is stopped.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut cache = self.models.lock().await;
        if let Some(models) = cache.as_ref() {
            return Ok(models.clone());
        }
        let response: GetModelsResponse =
            self.request_typed("models.list", serde_json::json!({})).await?;
        *cache = Some(response.models.clone());
        Ok(response.models)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn create_session(&self, config: SessionConfig) -> Result<Session> {
        self.sessions.create_session(config).await
    }

    pub async fn resume_session(
        &self,
        session_id: &str,
        config: ResumeSessionConfig,
    ) -> Result<Session> {
        self.sessions.resume_session(session_id, config).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>> {
        self.sessions.list_sessions().await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.delete_session(session_id).await
    }

    pub async fn get_last_session_id(&self) -> Result<Option<String>> {
        self.sessions.get_last_session_id().await
    }

    /// Handle for a session this client is tracking.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id)
    }
}

impl std::fmt::Debug for CopilotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopilotClient")
            .field("endpoint", self.endpoint())
            .field("state", &self.state())
            .field("sessions", &self.sessions.registry().len())
            .finish()
    }
}
