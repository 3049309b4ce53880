//! Tool and permission callbacks driven by the scripted engine.

mod common;

use common::FakeEngine;
use copilot_sdk::{
    CopilotClient, HandlerError, PermissionRequest, PermissionRequestResult, SessionConfig,
    SessionEventKind, Tool, ToolInvocation, ToolResult, approve_all, permission_handler,
};
use serde_json::json;

async fn turn_text(session: &copilot_sdk::Session, prompt: &str) -> String {
    let reply = session.send_and_wait(prompt, None).await.unwrap();
    match reply.map(|e| e.kind()) {
        Some(SessionEventKind::AssistantMessage { content, .. }) => content,
        other => panic!("expected an assistant message, got {other:?}"),
    }
}

fn echo_tool() -> Tool {
    Tool::new("echo_text", |invocation: ToolInvocation| async move {
        assert_eq!(invocation.tool_name, "echo_text");
        Ok::<_, HandlerError>(invocation.arguments["text"].as_str().unwrap_or("").to_string())
    })
    .with_description("Echo text")
    .with_parameters(json!({"type": "object", "properties": {"text": {"type": "string"}}}))
}

#[tokio::test]
async fn test_registered_tool_is_invoked() {
    let engine = FakeEngine::start().await;
    let client = CopilotClient::new(engine.options()).unwrap();
    let session = client
        .create_session(SessionConfig::new().with_tool(echo_tool()))
        .await
        .unwrap();

    let params = engine.create_params(session.id()).unwrap();
    assert_eq!(params["tools"][0]["name"], "echo_text");
    assert_eq!(params["tools"][0]["description"], "Echo text");

    assert_eq!(turn_text(&session, "tool:echo_text").await, "tool echo_text -> success: ping");

    let completed = session.events().into_iter().find_map(|e| match e.kind() {
        SessionEventKind::ToolExecutionComplete { success, .. } => Some(success),
        _ => None,
    });
    assert_eq!(completed, Some(true));
}

#[tokio::test]
async fn test_unknown_tool_gets_failure_result() {
    let engine = FakeEngine::start().await;
    let client = CopilotClient::new(engine.options()).unwrap();
    let session = client
        .create_session(SessionConfig::new().with_tool(echo_tool()))
        .await
        .unwrap();

    let text = turn_text(&session, "tool:missing_tool").await;
    assert!(text.starts_with("tool missing_tool -> failure"), "{text}");

    let replies = engine.tool_replies();
    let result: ToolResult = serde_json::from_value(replies[0]["result"].clone()).unwrap();
    assert_eq!(result.error.as_deref(), Some("tool 'missing_tool' not supported"));

    // The session keeps working.
    assert_eq!(turn_text(&session, "still here").await, "echo: still here");
}

#[tokio::test]
async fn test_failing_tool_does_not_break_session() {
    let engine = FakeEngine::start().await;
    let client = CopilotClient::new(engine.options()).unwrap();
    let broken = Tool::new("broken", |_invocation| async {
        Err::<String, _>("database unavailable")
    });
    let session = client
        .create_session(SessionConfig::new().with_tool(broken))
        .await
        .unwrap();

    let text = turn_text(&session, "tool:broken").await;
    assert!(text.starts_with("tool broken -> failure"), "{text}");
    let result: ToolResult =
        serde_json::from_value(engine.tool_replies()[0]["result"].clone()).unwrap();
    assert_eq!(result.error.as_deref(), Some("database unavailable"));

    assert_eq!(turn_text(&session, "next").await, "echo: next");
}

#[tokio::test]
async fn test_tools_are_scoped_per_session() {
    let engine = FakeEngine::start().await;
    let client = CopilotClient::new(engine.options()).unwrap();
    let with_tool = client
        .create_session(SessionConfig::new().with_tool(echo_tool()))
        .await
        .unwrap();
    let without_tool = client.create_session(SessionConfig::new()).await.unwrap();

    assert!(turn_text(&without_tool, "tool:echo_text").await.contains("failure"));
    assert!(turn_text(&with_tool, "tool:echo_text").await.contains("success"));
}

#[tokio::test]
async fn test_permission_handler_decides() {
    let engine = FakeEngine::start().await;
    let client = CopilotClient::new(engine.options()).unwrap();
    let session = client
        .create_session(SessionConfig::new().with_permission_handler(approve_all()))
        .await
        .unwrap();
    assert_eq!(engine.create_params(session.id()).unwrap()["requestPermission"], true);

    assert_eq!(turn_text(&session, "permission:write").await, "permission write -> approved");
}

#[tokio::test]
async fn test_permission_handler_sees_extension_fields() {
    let engine = FakeEngine::start().await;
    let client = CopilotClient::new(engine.options()).unwrap();
    let handler = permission_handler(|request: PermissionRequest, _invocation| async move {
        if request.field_str("path") == Some("/tmp/fake-engine.txt") {
            Ok::<_, HandlerError>(PermissionRequestResult::denied_interactively())
        } else {
            Ok(PermissionRequestResult::approved())
        }
    });
    let session = client
        .create_session(SessionConfig::new().with_permission_handler(handler))
        .await
        .unwrap();

    assert_eq!(
        turn_text(&session, "permission:write").await,
        "permission write -> denied-interactively-by-user"
    );
}

#[tokio::test]
async fn test_missing_or_failing_permission_handler_denies() {
    let engine = FakeEngine::start().await;
    let client = CopilotClient::new(engine.options()).unwrap();

    let no_handler = client.create_session(SessionConfig::new()).await.unwrap();
    assert_eq!(
        turn_text(&no_handler, "permission:shell").await,
        "permission shell -> denied-no-approval-rule-and-could-not-request-from-user"
    );

    let failing = permission_handler(|_request, _invocation| async {
        Err::<PermissionRequestResult, _>("policy service down")
    });
    let session = client
        .create_session(SessionConfig::new().with_permission_handler(failing))
        .await
        .unwrap();
    assert_eq!(
        turn_text(&session, "permission:shell").await,
        "permission shell -> denied-no-approval-rule-and-could-not-request-from-user"
    );
    assert_eq!(engine.permission_replies().len(), 2);
}
