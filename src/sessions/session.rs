//! Per-session state and the caller-facing [`Session`] handle.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use copilot_sdk_rpc::JsonRpcClient;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use super::SessionManager;
use crate::dispatch::{PermissionHandler, ToolRegistry};
use crate::error::{CopilotError, Result};
use crate::protocol::events::event_types;
use crate::protocol::{
    MessageOptions, SessionEvent, SessionGetMessagesResponse, SessionIdParams,
    SessionSendParams, SessionSendResponse,
};
use crate::streaming::StreamKind;

/// Default deadline for [`Session::send_and_wait`].
pub const DEFAULT_SEND_AND_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Callback invoked synchronously, in arrival order, for every session event.
pub type EventListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Everything this client tracks for one session.
pub(crate) struct SessionState {
    pub(crate) id: String,
    workspace_path: RwLock<Option<String>>,
    pub(crate) tools: RwLock<ToolRegistry>,
    pub(crate) permission_handler: RwLock<Option<PermissionHandler>>,
    streaming: AtomicBool,
    log: Mutex<Vec<SessionEvent>>,
    listeners: Mutex<Vec<(u64, EventListener)>>,
    channels: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    next_listener_id: AtomicU64,
    /// Serializes `session.send` per session.
    send_lock: tokio::sync::Mutex<()>,
    destroyed: AtomicBool,
}

impl SessionState {
    pub(crate) fn new(
        id: String,
        workspace_path: Option<String>,
        tools: ToolRegistry,
        permission_handler: Option<PermissionHandler>,
        streaming: bool,
    ) -> Self {
        Self {
            id,
            workspace_path: RwLock::new(workspace_path),
            tools: RwLock::new(tools),
            permission_handler: RwLock::new(permission_handler),
            streaming: AtomicBool::new(streaming),
            log: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            send_lock: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Replace handlers after a resume of an already-tracked session.
    pub(crate) fn reconfigure(
        &self,
        workspace_path: Option<String>,
        tools: ToolRegistry,
        permission_handler: Option<PermissionHandler>,
        streaming: bool,
    ) {
        if workspace_path.is_some() {
            *self.workspace_path.write() = workspace_path;
        }
        *self.tools.write() = tools;
        *self.permission_handler.write() = permission_handler;
        self.streaming.store(streaming, Ordering::SeqCst);
    }

    /// Append to the log and fan out. Runs on the connection's reader task.
    pub(crate) fn deliver(&self, event: SessionEvent) {
        self.log.lock().push(event.clone());

        // Snapshot so a listener may (un)subscribe from inside its callback.
        let listeners: Vec<EventListener> =
            self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                log::error!(
                    "Session: listener panicked on '{}' in session {}",
                    event.event_type,
                    self.id
                );
            }
        }

        self.channels.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn events(&self) -> Vec<SessionEvent> {
        self.log.lock().clone()
    }

    fn add_listener(&self, listener: EventListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Mark destroyed and end every channel subscription.
    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.channels.lock().clear();
        self.listeners.lock().clear();
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`Session::on`]; pass to [`Subscription::unsubscribe`]
/// to stop receiving events. Dropping it keeps the listener registered.
#[derive(Debug)]
pub struct Subscription {
    session: Weak<SessionState>,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|state| state.remove_listener(self.id))
    }
}

/// A conversation hosted by the engine.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Session {
    state: Arc<SessionState>,
    manager: SessionManager,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.state.id)
            .field("destroyed", &self.state.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(state: Arc<SessionState>, manager: SessionManager) -> Self {
        Self { state, manager }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Engine-side workspace directory, when infinite sessions are enabled.
    pub fn workspace_path(&self) -> Option<String> {
        self.state.workspace_path.read().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state.streaming.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.is_destroyed() {
            return Err(CopilotError::SessionNotFound(self.state.id.clone()));
        }
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        rpc: &JsonRpcClient,
        method: &str,
        params: Value,
    ) -> Result<T> {
        let value = rpc
            .call(method, Some(params), None)
            .await
            .map_err(|e| CopilotError::from(e).for_session(&self.state.id))?;
        serde_json::from_value(value)
            .map_err(|e| CopilotError::Protocol(format!("invalid '{method}' response: {e}")))
    }

    /// Queue a prompt. Returns the message id once the engine has accepted
    /// it; the answer arrives later as events ending with `session.idle`.
    ///
    /// Sends on one session are serialized.
    pub async fn send(&self, options: impl Into<MessageOptions>) -> Result<String> {
        self.ensure_live()?;
        let rpc = self.manager.rpc().await?;
        self.send_with(&rpc, options.into()).await
    }

    async fn send_with(&self, rpc: &JsonRpcClient, message: MessageOptions) -> Result<String> {
        let _turn = self.state.send_lock.lock().await;
        let params = SessionSendParams {
            session_id: self.state.id.clone(),
            message,
        };
        let response: SessionSendResponse = self
            .call(rpc, "session.send", serde_json::to_value(&params)?)
            .await?;
        log::debug!(
            "Session: {} accepted message {}",
            self.state.id,
            response.message_id
        );
        Ok(response.message_id)
    }

    /// Send and wait for the turn to finish.
    ///
    /// Resolves with the last `assistant.message` event of the turn (if any)
    /// once `session.idle` arrives. A `session.error` event fails with
    /// [`CopilotError::Session`]. On timeout the turn keeps running on the
    /// engine; call [`Session::abort`] to stop it.
    pub async fn send_and_wait(
        &self,
        options: impl Into<MessageOptions>,
        timeout: Option<Duration>,
    ) -> Result<Option<SessionEvent>> {
        self.ensure_live()?;
        let timeout = timeout.unwrap_or(DEFAULT_SEND_AND_WAIT_TIMEOUT);
        let rpc = self.manager.rpc().await?;

        // Subscribe first so a fast turn cannot finish unobserved.
        let mut events = self.subscribe();
        self.send_with(&rpc, options.into()).await?;

        let session_id = self.state.id.clone();
        let turn = async {
            let mut last_message = None;
            while let Some(event) = events.recv().await {
                match event.event_type.as_str() {
                    event_types::ASSISTANT_MESSAGE => last_message = Some(event),
                    event_types::SESSION_IDLE => return Ok(last_message),
                    event_types::SESSION_ERROR => {
                        let message = event
                            .data_str("message")
                            .unwrap_or("unknown session error")
                            .to_string();
                        return Err(CopilotError::Session(message));
                    }
                    _ => {}
                }
            }
            Err(CopilotError::SessionNotFound(session_id.clone()))
        };
        let turn_or_disconnect = async {
            tokio::select! {
                biased;
                outcome = turn => outcome,
                _ = rpc.closed() => Err(CopilotError::ConnectionLost),
            }
        };

        match tokio::time::timeout(timeout, turn_or_disconnect).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CopilotError::Timeout {
                method: "session.send_and_wait".to_string(),
                timeout,
            }),
        }
    }

    /// Ask the engine to stop the current turn. The session stays usable.
    pub async fn abort(&self) -> Result<()> {
        self.ensure_live()?;
        let rpc = self.manager.rpc().await?;
        let _: Value = self
            .call(&rpc, "session.abort", serde_json::to_value(SessionIdParams::new(&self.state.id))?)
            .await?;
        log::info!("Session: {} abort requested", self.state.id);
        Ok(())
    }

    /// The engine's replayed history for this session.
    ///
    /// This is authoritative; after resuming from another client it may be
    /// shorter than what that client observed.
    pub async fn get_messages(&self) -> Result<Vec<SessionEvent>> {
        self.ensure_live()?;
        let rpc = self.manager.rpc().await?;
        let response: SessionGetMessagesResponse = self
            .call(
                &rpc,
                "session.getMessages",
                serde_json::to_value(SessionIdParams::new(&self.state.id))?,
            )
            .await?;
        Ok(response.events)
    }

    /// Events observed by this client since the session was created or
    /// resumed here, in arrival order.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.state.events()
    }

    /// Register a listener. It runs on the connection's reader, so it must
    /// not block.
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.state.add_listener(Arc::new(listener));
        Subscription {
            session: Arc::downgrade(&self.state),
            id,
        }
    }

    /// Receive events on a channel instead of a callback. The channel ends
    /// when the session is destroyed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.state.is_destroyed() {
            self.state.channels.lock().push(tx);
        }
        rx
    }

    /// Text streamed so far for an unfinished assistant message.
    pub fn partial_message(&self, message_id: &str) -> Option<String> {
        self.manager
            .registry()
            .partial_text(&self.state.id, StreamKind::Message, message_id)
    }

    /// Release the session on the engine and forget it locally.
    ///
    /// The local state is dropped even if the engine call fails. Later calls
    /// on this handle fail with [`CopilotError::SessionNotFound`].
    pub async fn destroy(&self) -> Result<()> {
        self.ensure_live()?;
        let outcome = match self.manager.connected_rpc() {
            Some(rpc) => self
                .call::<Value>(
                    &rpc,
                    "session.destroy",
                    serde_json::to_value(SessionIdParams::new(&self.state.id))?,
                )
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        self.manager.registry().forget(&self.state.id);
        log::info!("Session: {} destroyed", self.state.id);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn state() -> Arc<SessionState> {
        Arc::new(SessionState::new(
            "s1".into(),
            None,
            ToolRegistry::new(),
            None,
            false,
        ))
    }

    #[test]
    fn test_deliver_logs_and_notifies_in_order() {
        let state = state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        state.add_listener(Arc::new(move |e: &SessionEvent| {
            seen_clone.lock().push(e.event_type.clone())
        }));

        for ty in ["session.start", "user.message", "session.idle"] {
            state.deliver(SessionEvent::new(ty, json!({})));
        }
        assert_eq!(*seen.lock(), vec!["session.start", "user.message", "session.idle"]);
        assert_eq!(state.log.lock().len(), 3);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let state = state();
        let count = Arc::new(AtomicUsize::new(0));
        state.add_listener(Arc::new(|_: &SessionEvent| panic!("listener bug")));
        let count_clone = Arc::clone(&count);
        state.add_listener(Arc::new(move |_: &SessionEvent| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        state.deliver(SessionEvent::new("session.idle", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_listener() {
        let state = state();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let id = state.add_listener(Arc::new(move |_: &SessionEvent| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let subscription = Subscription {
            session: Arc::downgrade(&state),
            id,
        };

        state.deliver(SessionEvent::new("session.idle", json!({})));
        assert!(subscription.unsubscribe());
        state.deliver(SessionEvent::new("session.idle", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channels_end_on_destroy() {
        let state = state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.channels.lock().push(tx);
        state.deliver(SessionEvent::new("user.message", json!({"content": "hi"})));
        state.mark_destroyed();

        assert_eq!(rx.recv().await.map(|e| e.event_type), Some("user.message".into()));
        assert!(rx.recv().await.is_none());
        assert!(state.is_destroyed());
    }
}
