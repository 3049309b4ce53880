//! Scripted fake engine for integration tests.
//!
//! Listens on `127.0.0.1:0` and speaks enough of the engine protocol for the
//! client to be exercised end to end through network mode. Prompts drive the
//! script:
//! - `tool:<name>` - calls `tool.call` for `<name>` with `{"text": "ping"}`
//! - `permission:<kind>` - sends a `permission.request` of that kind
//! - `slow` - holds the turn open until `session.abort`
//! - `stall` - streams one delta, then holds the turn open like `slow`
//! - `fail` - emits `session.error`
//! - anything else - answers `echo: <prompt>`
//!
//! Streaming sessions get the answer as three deltas before the final
//! `assistant.message`. `session.delete` refuses ids starting with `busy-`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use copilot_sdk::ClientOptions;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Default)]
struct SessionRecord {
    streaming: bool,
    create_params: Value,
    events: Vec<Value>,
    active_turn: Option<oneshot::Sender<()>>,
}

struct EngineState {
    protocol_version: Option<i64>,
    connections: AtomicUsize,
    requests: Mutex<Vec<(String, Value)>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    last_session: Mutex<Option<String>>,
    tool_replies: Mutex<Vec<Value>>,
    permission_replies: Mutex<Vec<Value>>,
    counter: AtomicU64,
    kill: watch::Sender<u64>,
}

pub struct FakeEngine {
    pub port: u16,
    state: Arc<EngineState>,
    accept_task: JoinHandle<()>,
}

impl FakeEngine {
    pub async fn start() -> Self {
        Self::with_protocol_version(Some(2)).await
    }

    pub async fn with_protocol_version(protocol_version: Option<i64>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (kill, _) = watch::channel(0);
        let state = Arc::new(EngineState {
            protocol_version,
            connections: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            last_session: Mutex::new(None),
            tool_replies: Mutex::new(Vec::new()),
            permission_replies: Mutex::new(Vec::new()),
            counter: AtomicU64::new(1),
            kill,
        });
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });
        Self {
            port,
            state,
            accept_task,
        }
    }

    /// Options reaching this engine through network mode, auto-restart off.
    pub fn options(&self) -> ClientOptions {
        ClientOptions::new()
            .with_cli_url(format!("127.0.0.1:{}", self.port))
            .with_auto_restart(false)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Params of every request received for `method`, in order.
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn create_params(&self, session_id: &str) -> Option<Value> {
        self.state
            .sessions
            .lock()
            .get(session_id)
            .map(|r| r.create_params.clone())
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.state.sessions.lock().contains_key(session_id)
    }

    pub fn tool_replies(&self) -> Vec<Value> {
        self.state.tool_replies.lock().clone()
    }

    pub fn permission_replies(&self) -> Vec<Value> {
        self.state.permission_replies.lock().clone()
    }

    /// Persist a session as if another client had created it.
    pub fn seed_session(&self, session_id: &str) {
        self.state.sessions.lock().insert(
            session_id.to_string(),
            SessionRecord {
                events: vec![json!({"type": "user.message", "data": {"content": "earlier"}})],
                ..Default::default()
            },
        );
    }

    /// Drop every open connection, as if the engine crashed.
    pub fn disconnect_all(&self) {
        self.state.kill.send_modify(|generation| *generation += 1);
    }

    /// Drop every connection and stop listening, so reconnects are refused.
    pub fn shut_down(&self) {
        self.accept_task.abort();
        self.disconnect_all();
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.disconnect_all();
    }
}

struct Conn {
    state: Arc<EngineState>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
}

impl Conn {
    async fn write(&self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        let _ = self.writer.lock().await.write_all(line.as_bytes()).await;
    }

    async fn reply(&self, id: Value, outcome: Result<Value, (i64, String)>) {
        let message = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            }),
        };
        self.write(message).await;
    }

    async fn event(&self, session_id: &str, event_type: &str, data: Value, ephemeral: bool) {
        let n = self.state.counter.fetch_add(1, Ordering::SeqCst);
        let mut event = json!({
            "id": format!("evt-{n}"),
            "timestamp": "2026-01-01T00:00:00Z",
            "type": event_type,
            "data": data,
        });
        if ephemeral {
            event["ephemeral"] = json!(true);
        } else if let Some(record) = self.state.sessions.lock().get_mut(session_id) {
            record.events.push(event.clone());
        }
        self.write(json!({
            "jsonrpc": "2.0",
            "method": "session.event",
            "params": {"sessionId": session_id, "event": event}
        }))
        .await;
    }

    async fn call(&self, method: &str, params: Value) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        self.write(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        rx.await.unwrap_or(Value::Null)
    }
}

async fn serve(stream: TcpStream, state: Arc<EngineState>) {
    let (read_half, write_half) = stream.into_split();
    let mut kill = state.kill.subscribe();
    let conn = Arc::new(Conn {
        state,
        writer: tokio::sync::Mutex::new(write_half),
        pending: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1000),
    });
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&conn, &line),
                _ => break,
            },
            _ = kill.changed() => break,
        }
    }
    let _ = conn.writer.lock().await.shutdown().await;
}

fn handle_line(conn: &Arc<Conn>, line: &str) {
    let Ok(message) = serde_json::from_str::<Value>(line) else {
        return;
    };
    match (message.get("method"), message.get("id")) {
        (Some(method), Some(id)) => {
            let method = method.as_str().unwrap_or_default().to_string();
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            tokio::spawn(handle_request(Arc::clone(conn), id.clone(), method, params));
        }
        (Some(_), None) => {}
        (None, Some(id)) => {
            let Some(id) = id.as_u64() else { return };
            if let Some(tx) = conn.pending.lock().remove(&id) {
                let payload = message
                    .get("result")
                    .cloned()
                    .unwrap_or_else(|| json!({"error": message.get("error").cloned()}));
                let _ = tx.send(payload);
            }
        }
        (None, None) => {}
    }
}

fn not_found(session_id: &str) -> (i64, String) {
    (-32603, format!("Session not found: {session_id}"))
}

async fn handle_request(conn: Arc<Conn>, id: Value, method: String, params: Value) {
    let state = Arc::clone(&conn.state);
    state.requests.lock().push((method.clone(), params.clone()));
    let session_id = params["sessionId"].as_str().unwrap_or_default().to_string();

    let outcome: Result<Value, (i64, String)> = match method.as_str() {
        "ping" => Ok(json!({
            "message": format!("pong: {}", params["message"].as_str().unwrap_or("")),
            "timestamp": 1_700_000_000_000i64,
            "protocolVersion": state.protocol_version,
        })),
        "status.get" => Ok(json!({"version": "0.0.0-test", "protocolVersion": 2})),
        "auth.getStatus" => Ok(json!({
            "isAuthenticated": true,
            "authType": "token",
            "login": "octocat"
        })),
        "models.list" => Ok(json!({
            "models": [{
                "id": "gpt-5",
                "name": "GPT-5",
                "capabilities": {
                    "supports": {"vision": false},
                    "limits": {"max_context_window_tokens": 200000}
                }
            }]
        })),
        "session.create" => {
            let n = state.counter.fetch_add(1, Ordering::SeqCst);
            let session_id = params["sessionId"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("session-{n}"));
            state.sessions.lock().insert(
                session_id.clone(),
                SessionRecord {
                    streaming: params["streaming"].as_bool().unwrap_or(false),
                    create_params: params.clone(),
                    ..Default::default()
                },
            );
            *state.last_session.lock() = Some(session_id.clone());
            Ok(json!({"sessionId": session_id}))
        }
        "session.resume" => {
            let mut sessions = state.sessions.lock();
            match sessions.get_mut(&session_id) {
                Some(record) => {
                    record.streaming = params["streaming"].as_bool().unwrap_or(false);
                    Ok(json!({"sessionId": session_id}))
                }
                None => Err(not_found(&session_id)),
            }
        }
        "session.send" => {
            let prompt = params["prompt"].as_str().unwrap_or_default().to_string();
            let turn = {
                let mut sessions = state.sessions.lock();
                match sessions.get_mut(&session_id) {
                    Some(record) => {
                        let (tx, rx) = oneshot::channel();
                        record.active_turn = Some(tx);
                        Ok((record.streaming, rx))
                    }
                    None => Err(not_found(&session_id)),
                }
            };
            match turn {
                Ok((streaming, cancel)) => {
                    let n = state.counter.fetch_add(1, Ordering::SeqCst);
                    let message_id = format!("msg-{n}");
                    conn.reply(id, Ok(json!({"messageId": message_id}))).await;
                    run_turn(conn, session_id, prompt, message_id, streaming, cancel).await;
                    return;
                }
                Err(err) => Err(err),
            }
        }
        "session.abort" => {
            let active = state
                .sessions
                .lock()
                .get_mut(&session_id)
                .map(|record| record.active_turn.take());
            match active {
                Some(active) => {
                    if let Some(cancel) = active
                        && cancel.send(()).is_ok()
                    {
                        conn.event(&session_id, "abort", json!({"reason": "user initiated"}), false)
                            .await;
                        conn.event(&session_id, "session.idle", json!({}), true).await;
                    }
                    Ok(json!({}))
                }
                None => Err(not_found(&session_id)),
            }
        }
        "session.getMessages" => match state.sessions.lock().get(&session_id) {
            Some(record) => Ok(json!({"events": record.events})),
            None => Err(not_found(&session_id)),
        },
        "session.destroy" => {
            if state.sessions.lock().contains_key(&session_id) {
                Ok(json!({}))
            } else {
                Err(not_found(&session_id))
            }
        }
        "session.list" => {
            let mut ids: Vec<String> = state.sessions.lock().keys().cloned().collect();
            ids.sort();
            let sessions: Vec<Value> = ids
                .iter()
                .map(|id| {
                    json!({
                        "sessionId": id,
                        "startTime": "2026-01-01T00:00:00Z",
                        "modifiedTime": "2026-01-01T00:00:00Z",
                        "isRemote": false
                    })
                })
                .collect();
            Ok(json!({"sessions": sessions}))
        }
        "session.delete" => {
            if session_id.starts_with("busy-") {
                Ok(json!({"success": false, "error": "session is busy"}))
            } else if state.sessions.lock().remove(&session_id).is_some() {
                Ok(json!({"success": true}))
            } else {
                Ok(json!({"success": false, "error": format!("Session not found: {session_id}")}))
            }
        }
        "session.getLastId" => Ok(json!({"sessionId": state.last_session.lock().clone()})),
        // Never answered; lets tests hold a call pending.
        "test.hang" => return,
        other => Err((-32601, format!("Method not found: {other}"))),
    };
    conn.reply(id, outcome).await;
}

async fn run_turn(
    conn: Arc<Conn>,
    session_id: String,
    prompt: String,
    message_id: String,
    streaming: bool,
    cancel: oneshot::Receiver<()>,
) {
    let sid = session_id.as_str();
    conn.event(sid, "user.message", json!({"content": prompt}), false).await;
    conn.event(sid, "assistant.turn_start", json!({"turnId": message_id}), false)
        .await;

    let content = if let Some(tool_name) = prompt.strip_prefix("tool:") {
        let call_id = format!("call-{message_id}");
        conn.event(
            sid,
            "tool.execution_start",
            json!({"toolCallId": call_id, "toolName": tool_name}),
            false,
        )
        .await;
        let reply = conn
            .call(
                "tool.call",
                json!({
                    "sessionId": sid,
                    "toolCallId": call_id,
                    "toolName": tool_name,
                    "arguments": {"text": "ping"}
                }),
            )
            .await;
        conn.state.tool_replies.lock().push(reply.clone());
        let result = &reply["result"];
        let result_type = result["resultType"].as_str().unwrap_or("missing").to_string();
        conn.event(
            sid,
            "tool.execution_complete",
            json!({"toolCallId": call_id, "success": result_type == "success"}),
            false,
        )
        .await;
        format!(
            "tool {tool_name} -> {result_type}: {}",
            result["textResultForLlm"].as_str().unwrap_or("")
        )
    } else if let Some(kind) = prompt.strip_prefix("permission:") {
        let reply = conn
            .call(
                "permission.request",
                json!({
                    "sessionId": sid,
                    "permissionRequest": {
                        "kind": kind,
                        "toolCallId": format!("perm-{message_id}"),
                        "path": "/tmp/fake-engine.txt"
                    }
                }),
            )
            .await;
        conn.state.permission_replies.lock().push(reply.clone());
        format!(
            "permission {kind} -> {}",
            reply["result"]["kind"].as_str().unwrap_or("missing")
        )
    } else if prompt == "slow" {
        tokio::select! {
            _ = cancel => return,
            _ = tokio::time::sleep(Duration::from_secs(10)) => "slow done".to_string(),
        }
    } else if prompt == "stall" {
        if streaming {
            conn.event(
                sid,
                "assistant.message_delta",
                json!({"messageId": message_id, "deltaContent": "half an ans"}),
                true,
            )
            .await;
        }
        tokio::select! {
            _ = cancel => return,
            _ = tokio::time::sleep(Duration::from_secs(10)) => "stall done".to_string(),
        }
    } else if prompt == "fail" {
        conn.event(
            sid,
            "session.error",
            json!({"errorType": "model", "message": "model exploded"}),
            false,
        )
        .await;
        conn.event(sid, "session.idle", json!({}), true).await;
        return;
    } else {
        format!("echo: {prompt}")
    };

    if streaming {
        for chunk in split_in_three(&content) {
            conn.event(
                sid,
                "assistant.message_delta",
                json!({"messageId": message_id, "deltaContent": chunk}),
                true,
            )
            .await;
        }
    }
    conn.event(
        sid,
        "assistant.message",
        json!({"messageId": message_id, "content": content}),
        false,
    )
    .await;
    conn.event(sid, "assistant.turn_end", json!({"turnId": message_id}), false)
        .await;
    conn.event(sid, "session.idle", json!({}), true).await;
}

fn split_in_three(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = chars.len().div_ceil(3).max(1);
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}
