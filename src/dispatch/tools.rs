//! Tool registrations and `tool.call` dispatch.
//!
//! A [`Tool`] pairs the definition advertised to the engine with an async
//! handler. When the engine calls a tool, [`invoke_tool`] runs the handler on
//! its own task and normalizes whatever happens (value, error, panic, or an
//! unknown tool name) into a [`ToolResult`]. Nothing a handler does can fail
//! the RPC call or the session.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::protocol::{ToolCallParams, ToolDefinition, ToolResult};

/// Error type tool and permission handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a [`ToolHandler`].
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, HandlerError>> + Send>>;

/// Async tool implementation.
pub type ToolHandler = Arc<dyn Fn(ToolInvocation) -> ToolFuture + Send + Sync>;

/// Context handed to a tool handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl From<ToolCallParams> for ToolInvocation {
    fn from(params: ToolCallParams) -> Self {
        Self {
            session_id: params.session_id,
            tool_call_id: params.tool_call_id,
            tool_name: params.tool_name,
            arguments: params.arguments,
        }
    }
}

/// What a tool handler may return.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// A complete result, passed through untouched.
    Result(ToolResult),
    /// Plain text; becomes a success result.
    Text(String),
    /// Arbitrary JSON. A value shaped like a [`ToolResult`] passes through;
    /// strings become text; anything else is serialized to text.
    Json(Value),
}

impl From<ToolResult> for ToolOutput {
    fn from(result: ToolResult) -> Self {
        ToolOutput::Result(result)
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::Text(text)
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        ToolOutput::Text(text.to_string())
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        ToolOutput::Json(value)
    }
}

impl ToolOutput {
    /// Convert into the wire result.
    pub fn into_result(self) -> ToolResult {
        match self {
            ToolOutput::Result(result) => result,
            ToolOutput::Text(text) => ToolResult::success(text),
            ToolOutput::Json(Value::String(text)) => ToolResult::success(text),
            ToolOutput::Json(value) => {
                if looks_like_tool_result(&value)
                    && let Ok(result) = serde_json::from_value::<ToolResult>(value.clone())
                {
                    return result;
                }
                ToolResult::success(value.to_string())
            }
        }
    }
}

fn looks_like_tool_result(value: &Value) -> bool {
    value.get("textResultForLlm").is_some() && value.get("resultType").is_some()
}

/// A caller-implemented tool.
#[derive(Clone)]
pub struct Tool {
    pub definition: ToolDefinition,
    pub handler: ToolHandler,
}

impl Tool {
    /// Build a tool from an async closure.
    ///
    /// ```ignore
    /// let tool = Tool::new("lookup_issue", |inv: ToolInvocation| async move {
    ///     let id = inv.arguments["id"].as_str().unwrap_or_default().to_string();
    ///     Ok::<_, HandlerError>(format!("issue {id}: open"))
    /// })
    /// .with_description("Fetch an issue by id")
    /// .with_parameters(serde_json::json!({"type": "object"}));
    /// ```
    pub fn new<F, Fut, O, E>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        O: Into<ToolOutput>,
        E: Into<HandlerError>,
    {
        let handler: ToolHandler = Arc::new(move |invocation: ToolInvocation| -> ToolFuture {
            let fut = handler(invocation);
            Box::pin(async move {
                let outcome: Result<ToolOutput, HandlerError> = match fut.await {
                    Ok(output) => Ok(output.into()),
                    Err(err) => Err(err.into()),
                };
                outcome
            })
        });
        Self {
            definition: ToolDefinition {
                name: name.into(),
                description: None,
                parameters: None,
            },
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    /// JSON schema for the arguments; passed to the engine as-is.
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.definition.parameters = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Tools visible to one session, keyed by exact name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list; a later tool replaces an earlier one of the same name.
    pub fn from_tools(tools: impl IntoIterator<Item = Tool>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    /// Register a tool, returning the one it replaced.
    pub fn register(&mut self, tool: Tool) -> Option<Tool> {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            log::warn!("Tool: '{name}' registered twice; keeping the latest handler");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Definitions sent with `session.create` / `session.resume`, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Run one tool invocation and normalize the outcome.
///
/// `tool` is the registration found for `invocation.tool_name`, if any.
pub async fn invoke_tool(tool: Option<Tool>, invocation: ToolInvocation) -> ToolResult {
    let Some(tool) = tool else {
        log::warn!(
            "Tool: session {} called unregistered tool '{}'",
            invocation.session_id,
            invocation.tool_name
        );
        return ToolResult::unsupported(&invocation.tool_name);
    };

    let name = invocation.tool_name.clone();
    let call_id = invocation.tool_call_id.clone();
    log::debug!("Tool: invoking '{name}' (call {call_id})");

    // A separate task turns a panicking handler into a JoinError.
    let handle = tokio::spawn((tool.handler)(invocation));
    match handle.await {
        Ok(Ok(output)) => output.into_result(),
        Ok(Err(err)) => {
            log::warn!("Tool: '{name}' (call {call_id}) failed: {err}");
            ToolResult::handler_error(err.to_string())
        }
        Err(join_err) => {
            log::error!("Tool: '{name}' (call {call_id}) panicked: {join_err}");
            ToolResult::handler_error(format!("tool '{name}' panicked"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolResultType;
    use serde_json::json;

    fn invocation(name: &str, arguments: Value) -> ToolInvocation {
        ToolInvocation {
            session_id: "s1".into(),
            tool_call_id: "call-1".into(),
            tool_name: name.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_failure_result() {
        let result = invoke_tool(None, invocation("missing_tool", Value::Null)).await;
        assert_eq!(result.result_type, ToolResultType::Failure);
        assert_eq!(result.error.as_deref(), Some("tool 'missing_tool' not supported"));
    }

    #[tokio::test]
    async fn test_string_output_is_success() {
        let tool = Tool::new("echo", |inv: ToolInvocation| async move {
            Ok::<_, HandlerError>(inv.arguments["text"].as_str().unwrap_or("").to_string())
        });
        let result = invoke_tool(Some(tool), invocation("echo", json!({"text": "hi"}))).await;
        assert!(result.is_success());
        assert_eq!(result.text_result_for_llm, "hi");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure() {
        let tool = Tool::new("boom", |_inv| async { Err::<String, _>("disk on fire") });
        let result = invoke_tool(Some(tool), invocation("boom", Value::Null)).await;
        assert_eq!(result.result_type, ToolResultType::Failure);
        assert_eq!(result.error.as_deref(), Some("disk on fire"));
        assert_eq!(
            result.text_result_for_llm,
            "Invoking this tool produced an error. Detailed information is not available."
        );
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failure() {
        let tool = Tool::new("panics", |_inv| async {
            if true {
                panic!("bad handler");
            }
            Ok::<_, HandlerError>("unreachable")
        });
        let result = invoke_tool(Some(tool), invocation("panics", Value::Null)).await;
        assert_eq!(result.result_type, ToolResultType::Failure);
        assert_eq!(result.error.as_deref(), Some("tool 'panics' panicked"));
    }

    #[test]
    fn test_json_output_normalization() {
        let passthrough = ToolOutput::Json(json!({
            "textResultForLlm": "denied by policy",
            "resultType": "denied"
        }))
        .into_result();
        assert_eq!(passthrough.result_type, ToolResultType::Denied);

        let serialized = ToolOutput::Json(json!({"temp": 21})).into_result();
        assert!(serialized.is_success());
        assert_eq!(serialized.text_result_for_llm, r#"{"temp":21}"#);

        let text = ToolOutput::Json(json!("plain")).into_result();
        assert_eq!(text.text_result_for_llm, "plain");
    }

    #[test]
    fn test_registry_definitions_sorted_and_replaced() {
        let mut registry = ToolRegistry::from_tools([
            Tool::new("zeta", |_| async { Ok::<_, HandlerError>("z") }),
            Tool::new("alpha", |_| async { Ok::<_, HandlerError>("a") }).with_description("first"),
        ]);
        let replaced = registry.register(
            Tool::new("zeta", |_| async { Ok::<_, HandlerError>("z2") })
                .with_parameters(json!({"type": "object"})),
        );
        assert!(replaced.is_some());
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(registry.get("zeta").unwrap().definition.parameters.is_some());
    }
}
