// ABOUTME: Tests for the scripted mock backend.
// ABOUTME: Validates expectation matching, fallbacks and error scripting.

use roombridge_agent::backends::mock::MockBackend;
use roombridge_agent::{AgentEvent, ErrorCode, EventReceiver, ToolResultKind};
use serde_json::json;

async fn run_turn(events: &mut EventReceiver) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::PromptEcho { .. } | AgentEvent::SessionStarted { .. } => {}
            AgentEvent::TurnComplete { .. } => break,
            other => seen.push(other),
        }
    }
    seen
}

#[tokio::test]
async fn test_mock_backend_tool_response() {
    let handle = MockBackend::new()
        .on_prompt("read file")
        .respond_with(vec![
            AgentEvent::ToolCallStarted {
                id: "t1".to_string(),
                tool_name: "Read".to_string(),
                args: json!({"path": "/tmp/foo"}),
            },
            AgentEvent::ToolCallFinished {
                id: "t1".to_string(),
                tool_name: "Read".to_string(),
                result_kind: ToolResultKind::Success,
                result_text: "file contents".to_string(),
            },
            AgentEvent::AssistantText("Read the file".to_string()),
        ])
        .into_handle();
    let mut events = handle.events().unwrap();
    handle.start_session("sonnet", None).await.unwrap();
    handle.submit_turn("please read file now").await.unwrap();

    let seen = run_turn(&mut events).await;
    assert_eq!(seen.len(), 3);
    assert!(matches!(&seen[0], AgentEvent::ToolCallStarted { tool_name, .. } if tool_name == "Read"));
    assert!(matches!(
        &seen[1],
        AgentEvent::ToolCallFinished { result_kind: ToolResultKind::Success, .. }
    ));
}

#[tokio::test]
async fn test_mock_backend_unmatched_prompt_falls_back() {
    let handle = MockBackend::new().into_handle();
    let mut events = handle.events().unwrap();
    handle.start_session("sonnet", None).await.unwrap();
    handle.submit_turn("anything").await.unwrap();

    let seen = run_turn(&mut events).await;
    assert!(matches!(&seen[0], AgentEvent::AssistantText(t) if t.contains("no expectation for 'anything'")));
}

#[tokio::test]
async fn test_mock_backend_scripted_error() {
    let handle = MockBackend::new()
        .on_prompt("fail")
        .respond_error(ErrorCode::RateLimited, "slow down")
        .into_handle();
    let mut events = handle.events().unwrap();
    handle.start_session("sonnet", None).await.unwrap();
    handle.submit_turn("fail").await.unwrap();

    let seen = run_turn(&mut events).await;
    assert!(matches!(
        &seen[0],
        AgentEvent::Error { code: ErrorCode::RateLimited, message, .. } if message == "slow down"
    ));
}

#[tokio::test]
async fn test_mock_backend_session_ids_increment() {
    let handle = MockBackend::new().into_handle();
    let first = handle.start_session("sonnet", None).await.unwrap();
    let second = handle.start_session("sonnet", None).await.unwrap();
    assert_eq!(first.as_deref(), Some("mock-session-1"));
    assert_eq!(second.as_deref(), Some("mock-session-2"));
}
