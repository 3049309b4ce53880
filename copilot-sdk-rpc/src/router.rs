//! Correlated JSON-RPC client with inbound call dispatch.
//!
//! [`JsonRpcClient`] owns one [`Transport`]. A background reader task drains
//! the transport and:
//!
//! - resolves responses against the pending-call table (by id),
//! - dispatches inbound calls (method + id) to handlers registered with
//!   [`JsonRpcClient::register_handler`], each on its own tokio task,
//! - hands notifications to the notification handler synchronously, in
//!   arrival order.
//!
//! When the transport closes, every pending call fails with
//! [`RpcClientError::ConnectionLost`]. That teardown runs exactly once, no
//! matter whether it is triggered by EOF, a read error, or [`JsonRpcClient::close`].

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::RpcClientError;
use crate::transport::{FrameReader, FrameWriter, Transport};
use crate::wire::{IncomingMessage, Request, RequestId, Response, RpcError};

/// Boxed future returned by an inbound call handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// Handler for an inbound (server-initiated) call. Receives the raw params.
pub type RequestHandler = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;

/// Handler for inbound notifications. Receives the method name and params.
pub type NotificationHandler = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

/// Wrap an async closure as a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |params: Option<Value>| -> HandlerFuture { Box::pin(f(params)) })
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// An outgoing call awaiting its response.
struct PendingCall {
    method: String,
    issued_at: Instant,
    reply: oneshot::Sender<Result<Value, RpcClientError>>,
}

struct Shared {
    label: String,
    writer: tokio::sync::Mutex<FrameWriter>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    handlers: RwLock<HashMap<String, RequestHandler>>,
    notification_handler: RwLock<Option<NotificationHandler>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    async fn write_frame(&self, frame: &str) -> Result<(), RpcClientError> {
        let mut writer = self.writer.lock().await;
        match writer.send(frame).await {
            Ok(()) => Ok(()),
            Err(_) if self.closed.load(Ordering::SeqCst) => Err(RpcClientError::ConnectionLost),
            Err(e) => Err(RpcClientError::Io(e)),
        }
    }

    async fn send_response(&self, response: Response) {
        let id = response.id.clone();
        let frame = match serde_json::to_string(&response) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("RPC: failed to encode response id={id:?}: {e}");
                return;
            }
        };
        if let Err(e) = self.write_frame(&frame).await {
            log::warn!("RPC: failed to send response id={id:?} on {}: {e}", self.label);
        }
    }

    /// Resolve one pending call. Unknown ids (late, duplicate, or never
    /// issued) are protocol errors: logged and dropped.
    fn resolve(&self, msg: IncomingMessage) {
        let id = match &msg.id {
            Some(RequestId::Number(id)) => *id,
            Some(other) => {
                log::warn!("RPC: dropping response with foreign id {other} on {}", self.label);
                return;
            }
            None => return,
        };
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(call) => {
                log::trace!(
                    "RPC: response id={id} method={} after {:?}",
                    call.method,
                    call.issued_at.elapsed()
                );
                let outcome = msg.into_response().into_result().map_err(RpcClientError::from);
                // The caller may have given up (timeout, cancellation).
                let _ = call.reply.send(outcome);
            }
            None => {
                log::warn!("RPC: dropping response for unknown request id {id} on {}", self.label);
            }
        }
    }

    fn dispatch_call(self: &Arc<Self>, msg: IncomingMessage) {
        let (Some(id), Some(method)) = (msg.id, msg.method) else {
            return;
        };
        let handler = self.handlers.read().get(&method).cloned();
        let shared = Arc::clone(self);
        let params = msg.params;
        log::debug!("RPC: inbound call method={method} id={id}");

        // Handlers run off the reader's path so a slow one cannot stall
        // unrelated traffic. A panicking handler still gets a reply.
        tokio::spawn(async move {
            let response = match handler {
                Some(handler) => match tokio::spawn(handler(params)).await {
                    Ok(Ok(result)) => Response::success(id, result),
                    Ok(Err(err)) => Response::failure(id, err),
                    Err(join_err) => {
                        log::error!("RPC: handler for '{method}' failed: {join_err}");
                        Response::failure(id, RpcError::internal(format!("handler for '{method}' failed")))
                    }
                },
                None => {
                    log::warn!("RPC: no handler registered for inbound call '{method}'");
                    Response::failure(id, RpcError::method_not_found(&method))
                }
            };
            shared.send_response(response).await;
        });
    }

    fn dispatch_notification(&self, msg: IncomingMessage) {
        let Some(method) = msg.method else {
            return;
        };
        let handler = self.notification_handler.read().clone();
        match handler {
            Some(handler) => {
                let params = msg.params;
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| handler(&method, params)));
                if outcome.is_err() {
                    log::error!("RPC: notification handler panicked on '{method}'");
                }
            }
            None => log::debug!("RPC: ignoring notification '{method}' (no handler)"),
        }
    }

    /// Mark the connection closed and fail every pending call.
    ///
    /// Returns `true` only for the caller that performed the teardown.
    fn shutdown(&self, reason: &str) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let drained: Vec<(u64, PendingCall)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            log::warn!(
                "RPC: {} closed ({reason}); failing {} pending call(s)",
                self.label,
                drained.len()
            );
        } else {
            log::info!("RPC: {} closed ({reason})", self.label);
        }
        for (id, call) in drained {
            log::debug!("RPC: call id={id} method={} lost", call.method);
            let _ = call.reply.send(Err(RpcClientError::ConnectionLost));
        }
        self.closed_tx.send_replace(true);
        true
    }
}

/// Removes a pending entry when the awaiting call finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, PendingCall>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 endpoint speaking line-delimited JSON over a [`Transport`].
pub struct JsonRpcClient {
    shared: Arc<Shared>,
    /// Monotonically increasing request id counter.
    next_id: AtomicU64,
    /// Applied to calls that do not pass their own timeout.
    default_timeout: Option<Duration>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl JsonRpcClient {
    /// Create a client and start its reader task.
    ///
    /// Handlers should be registered before issuing the first call; inbound
    /// calls arriving for an unregistered method get a method-not-found
    /// reply.
    pub fn new(transport: Transport) -> Self {
        let label = transport.label().to_string();
        let (reader, writer) = transport.split();
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            label,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            notification_handler: RwLock::new(None),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(read_loop(reader_shared, reader));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            default_timeout: None,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    /// Set the timeout applied to calls that do not specify one.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Transport description (for logs).
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Register the handler for an inbound method, replacing any previous one.
    pub fn register_handler(&self, method: &str, handler: RequestHandler) {
        self.shared
            .handlers
            .write()
            .insert(method.to_string(), handler);
    }

    /// Set the notification handler, replacing any previous one.
    pub fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.shared.notification_handler.write() = Some(handler);
    }

    /// Issue a call and wait for its response.
    ///
    /// `timeout` overrides the client's default for this call only. Expiry
    /// fails the call with [`RpcClientError::Timeout`]; a late response for
    /// it is then dropped as unknown.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&Request::call(id, method, params))?;
        let timeout = timeout.or(self.default_timeout);
        let (tx, rx) = oneshot::channel();

        // Register before writing so a fast reply cannot miss its entry.
        // Checking `closed` under the table lock orders us against shutdown.
        {
            let mut pending = self.shared.pending.lock();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(RpcClientError::ConnectionLost);
            }
            pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    reply: tx,
                },
            );
        }
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            id,
        };

        log::trace!("RPC: call id={id} method={method}");
        self.shared.write_frame(&frame).await?;

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::warn!("RPC: call id={id} method={method} timed out after {limit:?}");
                    return Err(RpcClientError::Timeout {
                        method: method.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or(Err(RpcClientError::ConnectionLost))
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcClientError> {
        if self.is_closed() {
            return Err(RpcClientError::ConnectionLost);
        }
        let frame = serde_json::to_string(&Request::notification(method, params))?;
        self.shared.write_frame(&frame).await
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Resolve once the connection has been torn down (peer EOF, read error,
    /// or [`Self::close`]).
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        // The sender lives in `self.shared`, so this cannot fail while we
        // hold `&self`.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tear the connection down: fail pending calls with
    /// [`RpcClientError::ConnectionLost`], stop the reader and close the
    /// write side. Safe to call repeatedly and concurrently with a crash.
    pub async fn close(&self) {
        self.shared.shutdown("closed locally");
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.shared.writer.lock().await.close().await;
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.shared.shutdown("client dropped");
    }
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("label", &self.shared.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Reader task: the single consumer of the transport's read half.
async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    let reason = loop {
        let line = match reader.receive().await {
            Ok(Some(line)) => line,
            Ok(None) => break "peer closed the stream".to_string(),
            Err(e) => break format!("read error: {e}"),
        };

        let msg: IncomingMessage = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("RPC: failed to parse JSON-RPC message: {e}");
                if looks_like_call(&line) {
                    shared
                        .send_response(Response::unidentified(RpcError::invalid_request(e)))
                        .await;
                }
                continue;
            }
        };

        if msg.is_response() {
            shared.resolve(msg);
        } else if msg.is_rpc_call() {
            shared.dispatch_call(msg);
        } else if msg.is_notification() {
            shared.dispatch_notification(msg);
        } else {
            log::warn!("RPC: dropping unclassifiable message: {line}");
        }
    };
    shared.shutdown(&reason);
}

/// A JSON object carrying both `method` and `id`: the peer expects a reply
/// even though the message itself is malformed.
fn looks_like_call(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|value| match value {
            Value::Object(map) => Some(map.contains_key("method") && map.contains_key("id")),
            _ => None,
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
