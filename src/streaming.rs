//! Reassembly of streamed assistant text.
//!
//! With streaming enabled the engine emits `assistant.message_delta` and
//! `assistant.reasoning_delta` events carrying fragments keyed by message (or
//! reasoning) id, followed by one final `assistant.message` /
//! `assistant.reasoning` event with the full content. The aggregator buffers
//! fragments per `(session, stream, id)` and checks them against the final
//! event, after which the buffer is dropped. A turn that ends without one
//! (`session.idle` or `abort`) drops whatever its session still buffers.
//!
//! The aggregator never alters or withholds events; it only observes them.

use std::collections::HashMap;

use crate::protocol::{SessionEvent, SessionEventKind};

/// Which stream a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Message,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    session_id: String,
    kind: StreamKind,
    id: String,
}

/// Partial text for one message id, in arrival order.
#[derive(Debug, Default)]
struct DeltaBuffer {
    text: String,
    fragments: usize,
}

/// What an observed event meant for the stream it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// A fragment was appended; `text` is everything received so far.
    Partial {
        kind: StreamKind,
        id: String,
        text: String,
    },
    /// The final event arrived. `matched` is false when fragments were seen
    /// and their concatenation differs from the final content.
    Completed {
        kind: StreamKind,
        id: String,
        content: String,
        fragments: usize,
        matched: bool,
    },
    /// Not a streamed-content event.
    Ignored,
}

/// Per-client delta buffers for every session.
#[derive(Debug, Default)]
pub struct StreamingAggregator {
    buffers: HashMap<BufferKey, DeltaBuffer>,
}

impl StreamingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event (in arrival order) for `session_id`.
    pub fn observe(&mut self, session_id: &str, event: &SessionEvent) -> StreamUpdate {
        match event.kind() {
            SessionEventKind::AssistantMessageDelta {
                message_id,
                delta_content,
            } => self.push(session_id, StreamKind::Message, message_id, &delta_content),
            SessionEventKind::AssistantReasoningDelta {
                reasoning_id,
                delta_content,
            } => self.push(session_id, StreamKind::Reasoning, reasoning_id, &delta_content),
            SessionEventKind::AssistantMessage {
                message_id,
                content,
            } => self.complete(session_id, StreamKind::Message, message_id, content),
            SessionEventKind::AssistantReasoning {
                reasoning_id,
                content,
            } => self.complete(session_id, StreamKind::Reasoning, reasoning_id, content),
            SessionEventKind::SessionIdle | SessionEventKind::Abort { .. } => {
                let before = self.buffers.len();
                self.clear_session(session_id);
                let dropped = before - self.buffers.len();
                if dropped > 0 {
                    log::debug!(
                        "Stream: turn in session {session_id} ended with {dropped} unfinished stream(s)"
                    );
                }
                StreamUpdate::Ignored
            }
            _ => StreamUpdate::Ignored,
        }
    }

    /// Text received so far for an unfinished stream.
    pub fn partial_text(&self, session_id: &str, kind: StreamKind, id: &str) -> Option<&str> {
        let key = BufferKey {
            session_id: session_id.to_string(),
            kind,
            id: id.to_string(),
        };
        self.buffers.get(&key).map(|b| b.text.as_str())
    }

    /// Number of unfinished streams across all sessions.
    pub fn open_streams(&self) -> usize {
        self.buffers.len()
    }

    /// Drop every buffer belonging to `session_id`.
    pub fn clear_session(&mut self, session_id: &str) {
        self.buffers.retain(|key, _| key.session_id != session_id);
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    fn push(&mut self, session_id: &str, kind: StreamKind, id: String, fragment: &str) -> StreamUpdate {
        let key = BufferKey {
            session_id: session_id.to_string(),
            kind,
            id: id.clone(),
        };
        let buffer = self.buffers.entry(key).or_default();
        buffer.text.push_str(fragment);
        buffer.fragments += 1;
        StreamUpdate::Partial {
            kind,
            id,
            text: buffer.text.clone(),
        }
    }

    fn complete(&mut self, session_id: &str, kind: StreamKind, id: String, content: String) -> StreamUpdate {
        let key = BufferKey {
            session_id: session_id.to_string(),
            kind,
            id: id.clone(),
        };
        let (fragments, matched) = match self.buffers.remove(&key) {
            Some(buffer) => {
                let matched = buffer.text == content;
                if !matched {
                    log::warn!(
                        "Stream: {kind:?} {id} in session {session_id}: {} streamed byte(s) differ \
                         from final content ({} byte(s)); keeping final",
                        buffer.text.len(),
                        content.len()
                    );
                }
                (buffer.fragments, matched)
            }
            // Streaming disabled, or the final event is all there is.
            None => (0, true),
        };
        StreamUpdate::Completed {
            kind,
            id,
            content,
            fragments,
            matched,
        }
    }
}
