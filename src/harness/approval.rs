//! Permission policy and turn bookkeeping for the harness.

use crate::dispatch::{HandlerError, PermissionHandler, permission_handler};
use crate::protocol::{PermissionRequest, PermissionRequestResult, SessionEvent, SessionEventKind};

// ---------------------------------------------------------------------------
// Permission policy
// ---------------------------------------------------------------------------

/// How the harness answers `permission.request`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub auto_approve: bool,
    /// Kinds always denied, even with `auto_approve` (e.g. `shell`).
    pub deny_kinds: Vec<String>,
}

impl ApprovalPolicy {
    /// Decide one request.
    pub fn decide(&self, request: &PermissionRequest) -> PermissionRequestResult {
        let denied_kind = self
            .deny_kinds
            .iter()
            .any(|kind| kind.eq_ignore_ascii_case(&request.kind));
        if self.auto_approve && !denied_kind {
            PermissionRequestResult::approved()
        } else {
            PermissionRequestResult::denied_interactively()
        }
    }

    /// Wrap as a session permission handler. Each decision is printed.
    pub fn into_handler(self) -> PermissionHandler {
        permission_handler(move |request: PermissionRequest, invocation| {
            let decision = self.decide(&request);
            crate::harness::println_tee(format_args!(
                "[permission] {} ({}) in {} -> {}",
                request.kind,
                describe_request(&request),
                invocation.session_id,
                decision.kind
            ));
            async move { Ok::<_, HandlerError>(decision) }
        })
    }
}

/// Short human summary of a request's kind-specific fields.
pub fn describe_request(request: &PermissionRequest) -> String {
    ["fullCommandText", "command", "path", "fileName", "url", "intention"]
        .iter()
        .find_map(|field| request.field_str(field))
        .unwrap_or("no details")
        .to_string()
}

// ---------------------------------------------------------------------------
// Turn flags
// ---------------------------------------------------------------------------

/// Notable events seen during a harness run; drive the exit status.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarnessEventFlags {
    pub saw_failed_tool: bool,
    pub saw_session_error: bool,
    pub assistant_messages: usize,
}

impl HarnessEventFlags {
    pub fn record(&mut self, event: &SessionEvent) {
        match event.kind() {
            SessionEventKind::ToolExecutionComplete { success: false, .. } => {
                self.saw_failed_tool = true
            }
            SessionEventKind::SessionError { .. } => self.saw_session_error = true,
            SessionEventKind::AssistantMessage { .. } => self.assistant_messages += 1,
            _ => {}
        }
    }
}
