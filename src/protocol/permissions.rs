//! Permission request/response types.
//!
//! Covers the server-initiated `permission.request` call. The request is an
//! open payload: a `kind` discriminator plus kind-specific fields kept in
//! [`PermissionRequest::extra`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Decision kinds the engine understands.
pub mod decision {
    pub const APPROVED: &str = "approved";
    pub const DENIED_BY_RULES: &str = "denied-by-rules";
    pub const DENIED_NO_APPROVAL_RULE: &str =
        "denied-no-approval-rule-and-could-not-request-from-user";
    pub const DENIED_INTERACTIVELY: &str = "denied-interactively-by-user";
}

/// Parameters of the server-initiated `permission.request` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    pub session_id: String,
    pub permission_request: PermissionRequest,
}

/// What the engine wants to do: `shell`, `write`, `mcp`, `read`, `url`, or a
/// kind added later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Kind-specific fields (command text, file path, URL, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PermissionRequest {
    /// A kind-specific string field, if present.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

/// The caller's decision, sent back as `{result: {kind, rules?}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequestResult {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Value>>,
}

impl PermissionRequestResult {
    pub fn approved() -> Self {
        Self {
            kind: decision::APPROVED.to_string(),
            rules: None,
        }
    }

    pub fn denied_interactively() -> Self {
        Self {
            kind: decision::DENIED_INTERACTIVELY.to_string(),
            rules: None,
        }
    }

    /// The answer used when no handler is registered or the handler fails.
    pub fn denied_by_default() -> Self {
        Self {
            kind: decision::DENIED_NO_APPROVAL_RULE.to_string(),
            rules: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.kind == decision::APPROVED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_keeps_kind_specific_fields() {
        let params: PermissionRequestParams = serde_json::from_value(json!({
            "sessionId": "s1",
            "permissionRequest": {
                "kind": "shell",
                "toolCallId": "tc-9",
                "fullCommandText": "rm -rf build",
                "intention": "clean"
            }
        }))
        .unwrap();
        let req = params.permission_request;
        assert_eq!(req.kind, "shell");
        assert_eq!(req.tool_call_id.as_deref(), Some("tc-9"));
        assert_eq!(req.field_str("fullCommandText"), Some("rm -rf build"));
        assert!(!req.extra.contains_key("kind"));

        // Extension fields survive a round trip to the handler and back.
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["intention"], "clean");
    }

    #[test]
    fn test_default_decision_is_denied() {
        let decision = PermissionRequestResult::denied_by_default();
        assert!(!decision.is_approved());
        assert_eq!(
            serde_json::to_value(&decision).unwrap(),
            json!({"kind": "denied-no-approval-rule-and-could-not-request-from-user"})
        );
    }
}
