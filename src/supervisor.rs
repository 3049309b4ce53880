//! Engine process lifecycle and connection state machine.
//!
//! [`ProcessSupervisor`] owns the engine process (unless the engine is
//! external), the transport to it and the [`JsonRpcClient`] on top.
//!
//! ```text
//! Disconnected --start--> Connecting --handshake ok--> Connected
//!      ^                      |                            |
//!      |                      | failure                    | crash / exit
//!      |                      v                            v
//!      +------force_stop---- Error <-----------------------+
//!                             |
//!                             +--auto_restart (backoff)--> Connecting
//! ```
//!
//! Start attempts are serialized behind one async mutex, so any number of
//! concurrent callers share a single spawn. A per-connection monitor task
//! notices unexpected exits, fails pending calls and, when enabled, schedules
//! restarts.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use copilot_sdk_rpc::{JsonRpcClient, RpcClientError, Transport};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{CopilotError, Result, StopError};
use crate::options::{ClientOptions, ServerEndpoint};
use crate::protocol::{PingParams, PingResponse, SDK_PROTOCOL_VERSION};

/// Environment variable carrying the token to a spawned engine.
pub const AUTH_TOKEN_ENV: &str = "COPILOT_SDK_AUTH_TOKEN";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const PORT_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called on every fresh connection before the handshake, to register
/// inbound call and notification handlers.
pub type ConnectionSetup = Arc<dyn Fn(&JsonRpcClient) + Send + Sync>;

// ---------------------------------------------------------------------------
// Launch command
// ---------------------------------------------------------------------------

/// Program and arguments used to spawn the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Build the engine command line for a spawned endpoint.
///
/// A `.js` entry point is run through `node`.
pub fn launch_command(options: &ClientOptions, endpoint: &ServerEndpoint) -> LaunchCommand {
    let cli_path = options.effective_cli_path();
    let mut args = Vec::new();
    let program = if cli_path.ends_with(".js") {
        args.push(cli_path);
        "node".to_string()
    } else {
        cli_path
    };

    args.extend(options.cli_args.iter().cloned());
    args.push("--server".to_string());
    args.push("--log-level".to_string());
    args.push(options.log_level.as_str().to_string());

    match endpoint {
        ServerEndpoint::Stdio => args.push("--stdio".to_string()),
        ServerEndpoint::Tcp { port } if *port > 0 => {
            args.push("--port".to_string());
            args.push(port.to_string());
        }
        _ => {}
    }

    if options.github_token.is_some() {
        args.push("--auth-token-env".to_string());
        args.push(AUTH_TOKEN_ENV.to_string());
    }
    if !options.effective_use_logged_in_user() {
        args.push("--no-auto-login".to_string());
    }

    LaunchCommand { program, args }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// One live connection to the engine.
struct ActiveConnection {
    id: u64,
    rpc: Arc<JsonRpcClient>,
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<Option<String>>>>,
}

impl ActiveConnection {
    /// Close the transport (failing pending calls) and signal the monitor to
    /// kill the process.
    async fn shutdown(&self) {
        if let Some(kill) = self.kill_tx.lock().take() {
            let _ = kill.send(());
        }
        self.rpc.close().await;
    }
}

struct SupervisorInner {
    options: ClientOptions,
    endpoint: ServerEndpoint,
    setup: ConnectionSetup,
    state_tx: watch::Sender<ConnectionState>,
    active: Mutex<Option<Arc<ActiveConnection>>>,
    /// Serializes start attempts.
    start_lock: tokio::sync::Mutex<()>,
    /// Count of finished start attempts, successful or not.
    start_attempts: AtomicU64,
    /// Bumped by every stop; a start that began in an older epoch is discarded.
    epoch: AtomicU64,
    next_connection_id: AtomicU64,
    restart_attempts: AtomicU32,
    restarting: AtomicBool,
    launches: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Owns the engine process and the connection to it.
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    pub fn new(options: ClientOptions, endpoint: ServerEndpoint, setup: ConnectionSetup) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SupervisorInner {
                options,
                endpoint,
                setup,
                state_tx,
                active: Mutex::new(None),
                start_lock: tokio::sync::Mutex::new(()),
                start_attempts: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                next_connection_id: AtomicU64::new(1),
                restart_attempts: AtomicU32::new(0),
                restarting: AtomicBool::new(false),
                launches: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The most recent start or crash failure, cleared on a successful start.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Number of processes spawned (or external connections opened) so far.
    pub fn launch_count(&self) -> u64 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// PID of the engine process, when this client owns one.
    pub fn pid(&self) -> Option<u32> {
        self.inner.active.lock().as_ref().and_then(|c| c.pid)
    }

    /// The RPC client of the live connection, if connected.
    pub fn rpc(&self) -> Option<Arc<JsonRpcClient>> {
        self.inner.connected_rpc()
    }

    /// Return the live connection, starting the engine if needed.
    ///
    /// Idempotent: concurrent callers share one start attempt, including a
    /// failed one. Fails with [`CopilotError::NotConnected`] when
    /// `auto_start` is off, and refuses to leave the `Error` state when
    /// `auto_restart` is off (use [`Self::restart`]).
    pub async fn ensure_started(&self) -> Result<Arc<JsonRpcClient>> {
        if let Some(rpc) = self.inner.connected_rpc() {
            return Ok(rpc);
        }
        if !self.inner.options.auto_start {
            return Err(CopilotError::NotConnected);
        }
        self.inner.refuse_if_failed()?;
        self.start_shared(false).await
    }

    /// Start the engine explicitly, from any state.
    pub async fn start(&self) -> Result<Arc<JsonRpcClient>> {
        self.start_shared(true).await
    }

    async fn start_shared(&self, explicit: bool) -> Result<Arc<JsonRpcClient>> {
        let seen = self.inner.start_attempts.load(Ordering::SeqCst);
        let _guard = self.inner.start_lock.lock().await;
        if let Some(rpc) = self.inner.connected_rpc() {
            return Ok(rpc);
        }
        // An attempt finished while we queued for the lock: its outcome is ours.
        if self.inner.start_attempts.load(Ordering::SeqCst) != seen {
            let reason = self
                .last_error()
                .unwrap_or_else(|| "engine start did not complete".to_string());
            return Err(CopilotError::Connection(reason));
        }
        if !explicit {
            self.inner.refuse_if_failed()?;
        }
        self.inner.connect_locked().await
    }

    /// Tear down the connection and process unconditionally.
    ///
    /// Pending calls fail with `ConnectionLost` exactly once. Safe to call
    /// repeatedly and concurrently with crash handling.
    pub async fn force_stop(&self) {
        let connection = self.inner.detach();
        if let Some(connection) = connection {
            log::info!("Supervisor: force-stopping connection {}", connection.id);
            connection.shutdown().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Tear down like [`Self::force_stop`] but wait for the process to be
    /// reaped, reporting cleanup failures.
    pub async fn stop(&self) -> Vec<StopError> {
        let mut errors = Vec::new();
        let connection = self.inner.detach();
        if let Some(connection) = connection {
            log::info!("Supervisor: stopping connection {}", connection.id);
            connection.shutdown().await;
            let monitor = connection.monitor.lock().take();
            if let Some(monitor) = monitor {
                match tokio::time::timeout(STOP_WAIT, monitor).await {
                    Ok(Ok(None)) => {}
                    Ok(Ok(Some(err))) => errors.push(StopError::new(err)),
                    Ok(Err(join_err)) => {
                        errors.push(StopError::new(format!("Engine monitor failed: {join_err}")))
                    }
                    Err(_) => errors.push(StopError::new(format!(
                        "Engine process did not exit within {}s",
                        STOP_WAIT.as_secs()
                    ))),
                }
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        errors
    }

    /// Explicit recovery: force stop, then start.
    pub async fn restart(&self) -> Result<Arc<JsonRpcClient>> {
        self.force_stop().await;
        self.inner.restart_attempts.store(0, Ordering::SeqCst);
        self.start().await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Stops pending restarts; the child is killed on drop.
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(connection) = self.inner.active.lock().take()
            && let Some(kill) = connection.kill_tx.lock().take()
        {
            let _ = kill.send(());
        }
    }
}

impl SupervisorInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Supervisor: {previous} -> {state}");
        }
    }

    fn connected_rpc(&self) -> Option<Arc<JsonRpcClient>> {
        let active = self.active.lock();
        active
            .as_ref()
            .filter(|c| !c.rpc.is_closed())
            .map(|c| Arc::clone(&c.rpc))
    }

    /// Take the active connection out and invalidate in-flight starts.
    fn detach(&self) -> Option<Arc<ActiveConnection>> {
        let mut active = self.active.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        active.take()
    }

    /// Implicit use may not leave `Error` unless restarts are allowed.
    fn refuse_if_failed(&self) -> Result<()> {
        if *self.state_tx.borrow() != ConnectionState::Error || self.options.auto_restart {
            return Ok(());
        }
        let reason = self
            .last_error
            .lock()
            .clone()
            .unwrap_or_else(|| "engine is not running".to_string());
        Err(CopilotError::Connection(format!(
            "{reason} (auto_restart is disabled; call restart())"
        )))
    }

    /// One start attempt. Caller holds `start_lock`.
    async fn connect_locked(self: &Arc<Self>) -> Result<Arc<JsonRpcClient>> {
        let outcome = self.connect_once().await;
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn connect_once(self: &Arc<Self>) -> Result<Arc<JsonRpcClient>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let connection = match self.establish().await {
            Ok(connection) => connection,
            Err(err) => {
                log::error!("Supervisor: start failed: {err}");
                *self.last_error.lock() = Some(err.to_string());
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    self.set_state(ConnectionState::Error);
                }
                return Err(err);
            }
        };

        let stale = {
            let mut active = self.active.lock();
            if self.epoch.load(Ordering::SeqCst) == epoch {
                *active = Some(Arc::clone(&connection));
                false
            } else {
                true
            }
        };
        if stale {
            log::info!("Supervisor: stopped while starting; discarding connection");
            connection.shutdown().await;
            return Err(CopilotError::Connection(
                "client was stopped while starting".to_string(),
            ));
        }

        self.restart_attempts.store(0, Ordering::SeqCst);
        *self.last_error.lock() = None;
        self.set_state(ConnectionState::Connected);
        Ok(Arc::clone(&connection.rpc))
    }

    /// Spawn (or dial), wire up, handshake and start the monitor.
    async fn establish(self: &Arc<Self>) -> Result<Arc<ActiveConnection>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);

        let (transport, mut child) = match &self.endpoint {
            ServerEndpoint::External { host, port } => {
                log::info!("Supervisor: connecting to external engine at {host}:{port}");
                let transport = Transport::connect_tcp(host, *port).await.map_err(|e| {
                    CopilotError::Connection(format!("Failed to connect to {host}:{port}: {e}"))
                })?;
                (transport, None)
            }
            ServerEndpoint::Stdio => {
                let mut child = self.spawn_engine()?;
                let transport = Transport::from_child(&mut child)?;
                (transport, Some(child))
            }
            ServerEndpoint::Tcp { .. } => {
                let mut child = self.spawn_engine()?;
                let port = match wait_for_port(&mut child).await {
                    Ok(port) => port,
                    Err(err) => {
                        let _ = child.kill().await;
                        return Err(err);
                    }
                };
                log::info!("Supervisor: engine listening on port {port}");
                match Transport::connect_tcp("127.0.0.1", port).await {
                    Ok(transport) => (transport, Some(child)),
                    Err(e) => {
                        let _ = child.kill().await;
                        return Err(CopilotError::Connection(format!(
                            "Failed to connect to engine on port {port}: {e}"
                        )));
                    }
                }
            }
        };

        let pid = child.as_ref().and_then(Child::id);
        let rpc = Arc::new(
            JsonRpcClient::new(transport).with_default_timeout(self.options.request_timeout),
        );
        (self.setup)(&rpc);

        if let Err(err) = handshake(&rpc).await {
            rpc.close().await;
            if let Some(child) = child.as_mut() {
                let _ = child.kill().await;
            }
            return Err(err);
        }
        log::info!("Supervisor: connected ({})", rpc.label());

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_connection(
            Arc::downgrade(self),
            id,
            Arc::clone(&rpc),
            child,
            kill_rx,
        ));
        Ok(Arc::new(ActiveConnection {
            id,
            rpc,
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            monitor: Mutex::new(Some(monitor)),
        }))
    }

    fn spawn_engine(&self) -> Result<Child> {
        let launch = launch_command(&self.options, &self.endpoint);
        let stdio_mode = self.endpoint == ServerEndpoint::Stdio;
        log::info!(
            "Supervisor: spawning engine: {} {}",
            launch.program,
            shell_words::join(&launch.args)
        );

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(if stdio_mode {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.options.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &self.options.env {
            command.env_clear().envs(env);
        }
        if let Some(token) = &self.options.github_token {
            command.env(AUTH_TOKEN_ENV, token);
        }

        let mut child = command.spawn().map_err(|e| {
            CopilotError::Connection(format!("Failed to spawn engine '{}': {e}", launch.program))
        })?;

        // Stderr is diagnostics only.
        if let Some(stderr) = child.stderr.take() {
            let pid = child.id().unwrap_or_default();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        log::warn!("Supervisor: engine[{pid}] stderr: {trimmed}");
                    }
                }
            });
        }
        Ok(child)
    }

    /// Called by a monitor when its connection died without being stopped.
    fn on_unexpected_exit(self: &Arc<Self>, connection_id: u64, reason: &str) {
        let epoch = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(current) if current.id == connection_id => {
                    *active = None;
                }
                // Stopped deliberately, or already replaced.
                _ => return,
            }
            self.epoch.load(Ordering::SeqCst)
        };

        log::error!("Supervisor: connection {connection_id} lost: {reason}");
        *self.last_error.lock() = Some(reason.to_string());
        self.set_state(ConnectionState::Error);

        if self.options.auto_restart {
            tokio::spawn(Arc::clone(self).restart_loop(epoch));
        }
    }

    async fn restart_loop(self: Arc<Self>, epoch: u64) {
        if self.restarting.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            self.run_restarts(epoch).await;
            self.restarting.store(false, Ordering::SeqCst);

            // A crash right after a successful restart saw the flag still set
            // and left the recovery to us.
            let missed = self.epoch.load(Ordering::SeqCst) == epoch
                && *self.state_tx.borrow() == ConnectionState::Error
                && self.connected_rpc().is_none()
                && self.restart_attempts.load(Ordering::SeqCst) < self.options.max_restart_attempts;
            if !missed || self.restarting.swap(true, Ordering::SeqCst) {
                return;
            }
            log::info!("Supervisor: connection lost again during restart; retrying");
        }
    }

    async fn run_restarts(self: &Arc<Self>, epoch: u64) {
        let max_attempts = self.options.max_restart_attempts;
        loop {
            let attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= max_attempts {
                log::error!("Supervisor: giving up after {max_attempts} restart attempt(s)");
                break;
            }
            let delay = backoff_delay(self.options.restart_backoff, attempt);
            log::info!(
                "Supervisor: restarting engine in {}ms (attempt {}/{max_attempts})",
                delay.as_millis(),
                attempt + 1
            );
            tokio::time::sleep(delay).await;

            if self.epoch.load(Ordering::SeqCst) != epoch {
                break;
            }
            let _guard = self.start_lock.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch || self.connected_rpc().is_some() {
                break;
            }
            match self.connect_locked().await {
                Ok(_) => {
                    log::info!("Supervisor: engine restarted");
                    break;
                }
                Err(err) => log::warn!("Supervisor: restart attempt failed: {err}"),
            }
        }
    }
}

/// `base * 2^attempt`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

async fn handshake(rpc: &JsonRpcClient) -> Result<()> {
    let params = serde_json::to_value(PingParams::default())?;
    let value = rpc
        .call("ping", Some(params), Some(HANDSHAKE_TIMEOUT))
        .await
        .map_err(|err| match err {
            RpcClientError::ConnectionLost | RpcClientError::Io(_) => {
                CopilotError::Connection(format!("engine exited during startup ({err})"))
            }
            RpcClientError::Timeout { .. } => CopilotError::Connection(format!(
                "engine handshake timed out after {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            )),
            other => CopilotError::from(other),
        })?;
    let pong: PingResponse = serde_json::from_value(value)
        .map_err(|e| CopilotError::Protocol(format!("invalid ping response: {e}")))?;
    match pong.protocol_version {
        Some(version) if version == SDK_PROTOCOL_VERSION => Ok(()),
        actual => Err(CopilotError::ProtocolVersionMismatch {
            expected: SDK_PROTOCOL_VERSION,
            actual,
        }),
    }
}

/// Read the engine's stdout until it announces its TCP port.
async fn wait_for_port(child: &mut Child) -> Result<u16> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CopilotError::Connection("Failed to capture engine stdout".to_string()))?;
    let pattern = regex::Regex::new(r"listening on port (\d+)")
        .map_err(|e| CopilotError::Protocol(e.to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let announced = tokio::time::timeout(PORT_ANNOUNCE_TIMEOUT, async {
        while let Some(line) = lines.next_line().await? {
            if let Some(port) = pattern
                .captures(&line)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u16>().ok())
            {
                return Ok::<_, std::io::Error>(Some(port));
            }
            log::debug!("Supervisor: engine stdout: {line}");
        }
        Ok(None)
    })
    .await;

    let port = match announced {
        Ok(Ok(Some(port))) => port,
        Ok(Ok(None)) => {
            return Err(CopilotError::Connection(
                "engine exited before announcing its port".to_string(),
            ));
        }
        Ok(Err(e)) => return Err(CopilotError::Io(e)),
        Err(_) => {
            return Err(CopilotError::Connection(format!(
                "engine did not announce a port within {}s",
                PORT_ANNOUNCE_TIMEOUT.as_secs()
            )));
        }
    };

    // Keep draining stdout so the engine never blocks on a full pipe.
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            log::debug!("Supervisor: engine stdout: {line}");
        }
    });
    Ok(port)
}

enum MonitorEvent {
    Exited(String),
    StreamClosed,
    StopRequested,
}

/// Watches one connection until it ends. Returns a cleanup error, if any.
async fn monitor_connection(
    supervisor: Weak<SupervisorInner>,
    connection_id: u64,
    rpc: Arc<JsonRpcClient>,
    child: Option<Child>,
    mut kill_rx: oneshot::Receiver<()>,
) -> Option<String> {
    let reason = match child {
        Some(mut child) => {
            let event = tokio::select! {
                biased;
                _ = &mut kill_rx => MonitorEvent::StopRequested,
                status = child.wait() => MonitorEvent::Exited(match status {
                    Ok(status) => format!("engine exited with {status}"),
                    Err(e) => format!("failed to wait on engine: {e}"),
                }),
                _ = rpc.closed() => MonitorEvent::StreamClosed,
            };
            match event {
                MonitorEvent::StopRequested => return kill_and_reap(&mut child).await,
                MonitorEvent::Exited(reason) => reason,
                MonitorEvent::StreamClosed => {
                    // Either a deliberate close or the engine hung up; in both
                    // cases the process has no further use.
                    let cleanup = kill_and_reap(&mut child).await;
                    if let Some(err) = cleanup {
                        log::warn!("Supervisor: {err}");
                    }
                    "engine closed the connection".to_string()
                }
            }
        }
        None => {
            let event = tokio::select! {
                biased;
                _ = &mut kill_rx => MonitorEvent::StopRequested,
                _ = rpc.closed() => MonitorEvent::StreamClosed,
            };
            match event {
                MonitorEvent::StopRequested => return None,
                _ => "server closed the connection".to_string(),
            }
        }
    };

    // Fails anything still pending; no-op if the reader already did.
    rpc.close().await;
    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.on_unexpected_exit(connection_id, &reason);
    }
    None
}

async fn kill_and_reap(child: &mut Child) -> Option<String> {
    match child.try_wait() {
        Ok(Some(_)) => return None,
        Ok(None) => {}
        Err(e) => return Some(format!("Failed to query engine process: {e}")),
    }
    match child.kill().await {
        Ok(()) => None,
        Err(e) => Some(format!("Failed to kill engine process: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LogLevel;

    #[test]
    fn test_launch_command_stdio() {
        let opts = ClientOptions::new()
            .with_cli_path("/usr/local/bin/copilot")
            .with_cli_args(["--config-dir", "/tmp/cfg"])
            .with_log_level(LogLevel::Debug);
        let launch = launch_command(&opts, &ServerEndpoint::Stdio);
        assert_eq!(launch.program, "/usr/local/bin/copilot");
        assert_eq!(
            launch.args,
            vec!["--config-dir", "/tmp/cfg", "--server", "--log-level", "debug", "--stdio"]
        );
    }

    #[test]
    fn test_launch_command_tcp_and_node() {
        let opts = ClientOptions::new().with_cli_path("/opt/copilot/index.js");
        let launch = launch_command(&opts, &ServerEndpoint::Tcp { port: 4321 });
        assert_eq!(launch.program, "node");
        assert_eq!(
            launch.args,
            vec!["/opt/copilot/index.js", "--server", "--log-level", "info", "--port", "4321"]
        );

        let random = launch_command(&opts, &ServerEndpoint::Tcp { port: 0 });
        assert!(!random.args.contains(&"--port".to_string()));
    }

    #[test]
    fn test_launch_command_auth_flags() {
        let opts = ClientOptions::new()
            .with_cli_path("copilot")
            .with_github_token("gho_secret");
        let launch = launch_command(&opts, &ServerEndpoint::Stdio);
        let joined = launch.args.join(" ");
        assert!(joined.contains("--auth-token-env COPILOT_SDK_AUTH_TOKEN"));
        // A token alone turns stored-credential lookup off.
        assert!(joined.contains("--no-auto-login"));
        // The token itself never appears on the command line.
        assert!(!joined.contains("gho_secret"));

        let opts = ClientOptions::new()
            .with_cli_path("copilot")
            .with_github_token("gho_secret")
            .with_use_logged_in_user(true);
        let launch = launch_command(&opts, &ServerEndpoint::Stdio);
        assert!(!launch.args.contains(&"--no-auto-login".to_string()));
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, 64), Duration::MAX);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Error.as_str(), "error");
    }

    #[tokio::test]
    async fn test_auto_start_disabled_is_not_connected() {
        let opts = ClientOptions::new().with_auto_start(false);
        let supervisor = ProcessSupervisor::new(opts, ServerEndpoint::Stdio, Arc::new(|_| {}));
        assert!(matches!(
            supervisor.ensure_started().await,
            Err(CopilotError::NotConnected)
        ));
        assert_eq!(supervisor.launch_count(), 0);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_force_stop_when_idle_is_noop() {
        let supervisor = ProcessSupervisor::new(
            ClientOptions::default(),
            ServerEndpoint::Stdio,
            Arc::new(|_| {}),
        );
        supervisor.force_stop().await;
        supervisor.force_stop().await;
        assert!(supervisor.stop().await.is_empty());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }
}
