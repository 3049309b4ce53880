//! Session event types.
//!
//! Events arrive as the `session.event` notification. The envelope is typed;
//! the `data` payload stays open JSON so new event types need no protocol
//! change. [`SessionEvent::kind`] gives a typed view of the ones this crate
//! knows about.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names.
pub mod event_types {
    pub const SESSION_START: &str = "session.start";
    pub const SESSION_RESUME: &str = "session.resume";
    pub const SESSION_IDLE: &str = "session.idle";
    pub const SESSION_ERROR: &str = "session.error";
    pub const USER_MESSAGE: &str = "user.message";
    pub const ASSISTANT_TURN_START: &str = "assistant.turn_start";
    pub const ASSISTANT_TURN_END: &str = "assistant.turn_end";
    pub const ASSISTANT_MESSAGE: &str = "assistant.message";
    pub const ASSISTANT_MESSAGE_DELTA: &str = "assistant.message_delta";
    pub const ASSISTANT_REASONING: &str = "assistant.reasoning";
    pub const ASSISTANT_REASONING_DELTA: &str = "assistant.reasoning_delta";
    pub const TOOL_EXECUTION_START: &str = "tool.execution_start";
    pub const TOOL_EXECUTION_COMPLETE: &str = "tool.execution_complete";
    pub const ABORT: &str = "abort";
}

/// Parameters of the `session.event` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventParams {
    pub session_id: String,
    pub event: SessionEvent,
}

/// One event in a session's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Ephemeral events (deltas, progress) are not replayed by `getMessages`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl SessionEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            timestamp: None,
            parent_id: None,
            ephemeral: None,
            event_type: event_type.into(),
            data,
        }
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// A string field of `data`.
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Parse into a typed kind. Unrecognized types map to
    /// [`SessionEventKind::Unknown`].
    pub fn kind(&self) -> SessionEventKind {
        use event_types::*;

        let text = |field: &str| self.data_str(field).unwrap_or("").to_string();

        match self.event_type.as_str() {
            SESSION_START => SessionEventKind::SessionStart {
                session_id: self.data_str("sessionId").map(String::from),
            },
            SESSION_RESUME => SessionEventKind::SessionResume,
            SESSION_IDLE => SessionEventKind::SessionIdle,
            SESSION_ERROR => SessionEventKind::SessionError {
                error_type: self.data_str("errorType").map(String::from),
                message: text("message"),
            },
            USER_MESSAGE => SessionEventKind::UserMessage {
                content: text("content"),
            },
            ASSISTANT_TURN_START => SessionEventKind::AssistantTurnStart,
            ASSISTANT_TURN_END => SessionEventKind::AssistantTurnEnd,
            ASSISTANT_MESSAGE => SessionEventKind::AssistantMessage {
                message_id: text("messageId"),
                content: text("content"),
            },
            ASSISTANT_MESSAGE_DELTA => SessionEventKind::AssistantMessageDelta {
                message_id: text("messageId"),
                delta_content: text("deltaContent"),
            },
            ASSISTANT_REASONING => SessionEventKind::AssistantReasoning {
                reasoning_id: text("reasoningId"),
                content: text("content"),
            },
            ASSISTANT_REASONING_DELTA => SessionEventKind::AssistantReasoningDelta {
                reasoning_id: text("reasoningId"),
                delta_content: text("deltaContent"),
            },
            TOOL_EXECUTION_START => SessionEventKind::ToolExecutionStart {
                tool_call_id: text("toolCallId"),
                tool_name: text("toolName"),
            },
            TOOL_EXECUTION_COMPLETE => SessionEventKind::ToolExecutionComplete {
                tool_call_id: text("toolCallId"),
                success: self
                    .data
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            ABORT => SessionEventKind::Abort {
                reason: self.data_str("reason").map(String::from),
            },
            other => SessionEventKind::Unknown {
                event_type: other.to_string(),
            },
        }
    }
}

/// A parsed session event. Not serde-derived: dispatch is on the envelope's
/// `type` and fields are read leniently from `data`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    SessionStart { session_id: Option<String> },
    SessionResume,
    /// The engine finished processing the turn.
    SessionIdle,
    SessionError {
        error_type: Option<String>,
        message: String,
    },
    UserMessage { content: String },
    AssistantTurnStart,
    AssistantTurnEnd,
    /// The complete content of an assistant message.
    AssistantMessage { message_id: String, content: String },
    /// A streamed fragment of an assistant message.
    AssistantMessageDelta {
        message_id: String,
        delta_content: String,
    },
    AssistantReasoning { reasoning_id: String, content: String },
    AssistantReasoningDelta {
        reasoning_id: String,
        delta_content: String,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolExecutionComplete { tool_call_id: String, success: bool },
    Abort { reason: Option<String> },
    /// Unrecognized event type; the raw event is still delivered.
    Unknown { event_type: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_notification_params() {
        let params: SessionEventParams = serde_json::from_value(json!({
            "sessionId": "s1",
            "event": {
                "id": "e1",
                "timestamp": "2025-01-01T00:00:00Z",
                "parentId": null,
                "ephemeral": true,
                "type": "assistant.message_delta",
                "data": {"messageId": "m1", "deltaContent": "Hel"}
            }
        }))
        .unwrap();
        assert_eq!(params.session_id, "s1");
        assert_eq!(params.event.ephemeral, Some(true));
        assert_eq!(
            params.event.kind(),
            SessionEventKind::AssistantMessageDelta {
                message_id: "m1".into(),
                delta_content: "Hel".into()
            }
        );
    }

    #[test]
    fn test_kind_error_and_idle() {
        let err = SessionEvent::new(
            "session.error",
            json!({"errorType": "model", "message": "rate limited"}),
        );
        assert_eq!(
            err.kind(),
            SessionEventKind::SessionError {
                error_type: Some("model".into()),
                message: "rate limited".into()
            }
        );
        // `data` may be absent entirely.
        let idle: SessionEvent = serde_json::from_value(json!({"type": "session.idle"})).unwrap();
        assert_eq!(idle.kind(), SessionEventKind::SessionIdle);
    }

    #[test]
    fn test_unknown_kind_preserved() {
        let event = SessionEvent::new("session.compaction_start", json!({}));
        assert_eq!(
            event.kind(),
            SessionEventKind::Unknown {
                event_type: "session.compaction_start".into()
            }
        );
    }
}
