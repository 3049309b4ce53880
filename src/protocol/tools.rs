//! Tool definitions and the `tool.call` exchange.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A caller-implemented tool as advertised to the engine.
///
/// `parameters` is a JSON schema passed through as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Parameters of the server-initiated `tool.call` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallParams {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Reply to `tool.call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub result: ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultType {
    Success,
    Failure,
    Rejected,
    Denied,
}

/// A binary payload (image, file) returned by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBinaryResult {
    pub data: String,
    pub mime_type: String,
    #[serde(rename = "type")]
    pub result_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The normalized outcome of every tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub text_result_for_llm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_results_for_llm: Option<Vec<ToolBinaryResult>>,
    pub result_type: ToolResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_telemetry: Option<Map<String, Value>>,
}

impl ToolResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: text.into(),
            binary_results_for_llm: None,
            result_type: ToolResultType::Success,
            error: None,
            session_log: None,
            tool_telemetry: None,
        }
    }

    /// A failure whose `text` is shown to the model and `error` is kept for
    /// diagnostics.
    pub fn failure(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: text.into(),
            binary_results_for_llm: None,
            result_type: ToolResultType::Failure,
            error: Some(error.into()),
            session_log: None,
            tool_telemetry: None,
        }
    }

    /// The reply for a tool name the session never registered.
    pub fn unsupported(tool_name: &str) -> Self {
        Self::failure(
            format!("Tool '{tool_name}' is not supported by this client instance."),
            format!("tool '{tool_name}' not supported"),
        )
    }

    /// The reply for a handler that failed. The model sees a generic text;
    /// the detailed message stays in `error`.
    pub fn handler_error(message: impl Into<String>) -> Self {
        Self {
            tool_telemetry: Some(Map::new()),
            ..Self::failure(
                "Invoking this tool produced an error. Detailed information is not available.",
                message,
            )
        }
    }

    pub fn with_binary(mut self, binary: ToolBinaryResult) -> Self {
        self.binary_results_for_llm
            .get_or_insert_with(Vec::new)
            .push(binary);
        self
    }

    pub fn is_success(&self) -> bool {
        self.result_type == ToolResultType::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unsupported_tool_result_wire_shape() {
        let value = serde_json::to_value(ToolResult::unsupported("missing_tool")).unwrap();
        assert_eq!(
            value,
            json!({
                "textResultForLlm": "Tool 'missing_tool' is not supported by this client instance.",
                "resultType": "failure",
                "error": "tool 'missing_tool' not supported"
            })
        );
    }

    #[test]
    fn test_handler_error_carries_message() {
        let result = ToolResult::handler_error("disk full");
        assert_eq!(result.error.as_deref(), Some("disk full"));
        assert_eq!(result.result_type, ToolResultType::Failure);
        assert_eq!(result.tool_telemetry, Some(Map::new()));
    }

    #[test]
    fn test_tool_call_params_default_arguments() {
        let params: ToolCallParams = serde_json::from_value(json!({
            "sessionId": "s", "toolCallId": "c", "toolName": "t"
        }))
        .unwrap();
        assert_eq!(params.arguments, Value::Null);
    }
}
