// ABOUTME: Tests for the Direct CLI backend against a fake claude script.
// ABOUTME: Exercises stream-json parsing, session id tracking and orphan recovery end to end.

#![cfg(unix)]

use roombridge_agent::backends::direct_cli::{DirectCliBackend, DirectCliConfig};
use roombridge_agent::{AgentEvent, EventReceiver, ErrorCode, ResumeOutcome};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

fn write_script(dir: &Path, body: &str) -> String {
    let path = dir.join("fake-claude.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

fn config(binary: String, dir: &Path) -> DirectCliConfig {
    DirectCliConfig {
        binary,
        sdk_url: None,
        working_dir: dir.to_path_buf(),
        model: Some("sonnet".to_string()),
        extra_args: Vec::new(),
    }
}

async fn turn_events(events: &mut EventReceiver) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let done = matches!(event, AgentEvent::TurnComplete { .. });
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

#[test]
fn test_config_deserializes_with_defaults() {
    let cfg: DirectCliConfig = serde_json::from_value(serde_json::json!({
        "binary": "claude",
        "sdk_url": "http://localhost:1234",
        "working_dir": "/tmp"
    }))
    .unwrap();
    assert_eq!(cfg.model, None);
    assert!(cfg.extra_args.is_empty());
    assert_eq!(cfg.sdk_url.as_deref(), Some("http://localhost:1234"));
}

#[tokio::test]
async fn test_direct_cli_streams_text_and_reports_session() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        r#"echo '{"type":"system","subtype":"init","session_id":"11111111-2222-3333-4444-555555555555"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello from cli"}]}}'
echo '{"type":"result","is_error":false,"usage":{"input_tokens":3,"output_tokens":4}}'"#,
    );
    let handle = DirectCliBackend::new(config(script, dir.path()))
        .unwrap()
        .into_handle();
    let mut events = handle.events().unwrap();

    handle.start_session("sonnet", None).await.unwrap();
    let _ = events.recv().await;
    handle.submit_turn("hi").await.unwrap();

    let seen = turn_events(&mut events).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, AgentEvent::AssistantText(t) if t == "hello from cli")));
    match seen.last() {
        Some(AgentEvent::TurnComplete { session_id, usage }) => {
            assert_eq!(
                session_id.as_deref(),
                Some("11111111-2222-3333-4444-555555555555")
            );
            assert_eq!(usage.as_ref().map(|u| u.output_tokens), Some(4));
        }
        other => panic!("expected TurnComplete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_direct_cli_orphaned_session_rotates_id() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "echo 'No conversation found with session ID: 6f1c' >&2\nexit 1",
    );
    let handle = DirectCliBackend::new(config(script, dir.path()))
        .unwrap()
        .into_handle();
    let mut events = handle.events().unwrap();

    let prior = "6f1c0000-0000-4000-8000-000000000000";
    assert_eq!(
        handle.resume_session(prior).await.unwrap(),
        ResumeOutcome::Resumed
    );
    let _ = events.recv().await;
    handle.submit_turn("hi").await.unwrap();

    let seen = turn_events(&mut events).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        AgentEvent::Error { code: ErrorCode::SessionOrphaned, recoverable: true, .. }
    )));
    match seen.last() {
        Some(AgentEvent::TurnComplete { session_id: Some(id), .. }) => assert_ne!(id, prior),
        other => panic!("expected TurnComplete with a fresh id, got {:?}", other),
    }
}

#[tokio::test]
async fn test_direct_cli_replays_message_after_expired_resume() {
    let dir = TempDir::new().unwrap();
    let prompts = dir.path().join("prompts.log");
    let script = write_script(
        dir.path(),
        &format!(
            r#"for last; do :; done
echo "$last" >> '{}'
for arg in "$@"; do
  if [ "$arg" = "--resume" ]; then
    echo 'No conversation found with session ID: 6f1c' >&2
    exit 1
  fi
done
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"answered"}}]}}}}'
echo '{{"type":"result","is_error":false}}'"#,
            prompts.display()
        ),
    );
    let handle = DirectCliBackend::new(config(script, dir.path()))
        .unwrap()
        .into_handle();
    let mut events = handle.events().unwrap();

    let prior = "6f1c0000-0000-4000-8000-000000000000";
    handle.resume_session(prior).await.unwrap();
    let _ = events.recv().await;
    handle.submit_turn("fix the build").await.unwrap();

    let seen = turn_events(&mut events).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, AgentEvent::AssistantText(t) if t == "answered")));
    match seen.last() {
        Some(AgentEvent::TurnComplete { session_id: Some(id), .. }) => assert_ne!(id, prior),
        other => panic!("expected TurnComplete with a fresh id, got {:?}", other),
    }
    // The same message reached the CLI twice: once on the stale id, once on the new one
    let logged = std::fs::read_to_string(&prompts).unwrap();
    assert_eq!(logged.lines().collect::<Vec<_>>(), vec!["fix the build", "fix the build"]);
}

#[tokio::test]
async fn test_direct_cli_rejects_malformed_resume_id() {
    let dir = TempDir::new().unwrap();
    let handle = DirectCliBackend::new(config("claude".to_string(), dir.path()))
        .unwrap()
        .into_handle();
    assert!(matches!(
        handle.resume_session("not-a-uuid").await.unwrap(),
        ResumeOutcome::Rejected { .. }
    ));
}

#[tokio::test]
async fn test_direct_cli_missing_binary_reports_backend_error() {
    let dir = TempDir::new().unwrap();
    let handle = DirectCliBackend::new(config(
        dir.path().join("does-not-exist").to_string_lossy().into_owned(),
        dir.path(),
    ))
    .unwrap()
    .into_handle();
    let mut events = handle.events().unwrap();
    handle.start_session("sonnet", None).await.unwrap();
    let _ = events.recv().await;
    handle.submit_turn("hi").await.unwrap();

    let seen = turn_events(&mut events).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        AgentEvent::Error { code: ErrorCode::BackendError, .. }
    )));
}
