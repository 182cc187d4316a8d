// ABOUTME: Direct CLI backend - spawns claude with --print --output-format stream-json per turn.
// ABOUTME: Parses streaming JSONL from stdout into AgentEvents and tracks the resumable session id.

use crate::event::{AgentEvent, ErrorCode, ToolResultKind, Usage};
use crate::handle::AgentHandle;
use crate::traits::{AgentBackend, ResumeOutcome};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio::sync::mpsc;

/// Marker the CLI prints on stderr when asked to resume an unknown session
const ORPHANED_SESSION_MARKER: &str = "No conversation found with session ID";

/// Configuration for the Direct CLI backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectCliConfig {
    /// Path to the claude binary
    pub binary: String,
    /// Optional SDK URL for the claude CLI (external agent endpoint)
    pub sdk_url: Option<String>,
    /// Working directory for the agent
    pub working_dir: PathBuf,
    /// Model used when a session is resumed rather than started
    #[serde(default)]
    pub model: Option<String>,
    /// Extra arguments appended before the prompt
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Conversation state carried between turns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliSession {
    pub session_id: Option<String>,
    /// Whether the CLI has already persisted this session (resume vs create)
    pub started: bool,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

impl CliSession {
    fn fresh(model: Option<String>, system_prompt: Option<String>) -> Self {
        Self {
            session_id: Some(uuid::Uuid::new_v4().to_string()),
            started: false,
            model,
            system_prompt,
        }
    }
}

pub struct DirectCliBackend {
    config: DirectCliConfig,
    session: Mutex<CliSession>,
}

impl DirectCliBackend {
    pub fn new(config: DirectCliConfig) -> Result<Self> {
        let session = CliSession {
            model: config.model.clone(),
            ..CliSession::default()
        };
        Ok(Self {
            config,
            session: Mutex::new(session),
        })
    }

    pub fn into_handle(self) -> AgentHandle {
        AgentHandle::spawn(self)
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::BackendFactory {
        Box::new(|config| {
            let cfg: DirectCliConfig = serde_json::from_value(config.clone())?;
            let backend = DirectCliBackend::new(cfg)?;
            Ok(backend.into_handle())
        })
    }

    fn snapshot(&self) -> CliSession {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update<F: FnOnce(&mut CliSession)>(&self, f: F) {
        f(&mut self.session.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Build the CLI arguments for one turn
pub fn cli_args(config: &DirectCliConfig, session: &CliSession, text: &str) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ];

    if let Some(ref session_id) = session.session_id {
        if session.started {
            args.push("--resume".to_string());
        } else {
            args.push("--session-id".to_string());
        }
        args.push(session_id.clone());
    }

    if let Some(ref model) = session.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    // The system prompt only needs to be supplied when the session is created
    if !session.started {
        if let Some(ref prompt) = session.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
    }

    if let Some(ref url) = config.sdk_url {
        args.push("--sdk-url".to_string());
        args.push(url.clone());
    }

    args.extend(config.extra_args.iter().cloned());
    args.push(text.to_string());
    args
}

impl AgentBackend for DirectCliBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn new_session<'a>(
        &'a self,
        model: &'a str,
        initial_prompt: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        async move {
            let model = Some(model.to_string()).filter(|m| !m.is_empty());
            let fresh = CliSession::fresh(model, initial_prompt.map(str::to_string));
            let session_id = fresh.session_id.clone();
            self.update(|s| *s = fresh);
            Ok(session_id)
        }
        .boxed()
    }

    fn load_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<ResumeOutcome>> {
        async move {
            if uuid::Uuid::parse_str(session_id).is_err() {
                return Ok(ResumeOutcome::Rejected {
                    reason: format!("'{}' is not a CLI session id", session_id),
                });
            }
            let model = self.config.model.clone();
            self.update(|s| {
                *s = CliSession {
                    session_id: Some(session_id.to_string()),
                    started: true,
                    model,
                    system_prompt: None,
                }
            });
            Ok(ResumeOutcome::Resumed)
        }
        .boxed()
    }

    fn prompt<'a>(
        &'a self,
        text: &'a str,
        events: mpsc::Sender<AgentEvent>,
    ) -> BoxFuture<'a, Result<Option<Usage>>> {
        async move {
            let mut session = self.snapshot();
            let args = cli_args(&self.config, &session, text);
            let mut report = run_prompt(&self.config, args, events.clone()).await?;

            if report.orphaned {
                let fresh = CliSession::fresh(session.model.clone(), session.system_prompt.clone());
                tracing::warn!(
                    old_session = session.session_id.as_deref().unwrap_or(""),
                    new_session = fresh.session_id.as_deref().unwrap_or(""),
                    "CLI session orphaned - replaying the message in a fresh session"
                );
                self.update(|s| *s = fresh.clone());
                session = fresh;
                let args = cli_args(&self.config, &session, text);
                report = run_prompt(&self.config, args, events).await?;
            }

            if report.orphaned {
                // Still unknown to the CLI; rotate again for the next turn
                let fresh = CliSession::fresh(session.model.clone(), session.system_prompt.clone());
                self.update(|s| *s = fresh);
            } else if report.success {
                self.update(|s| {
                    s.started = true;
                    if let Some(id) = report.session_id {
                        s.session_id = Some(id);
                    }
                });
            }

            Ok(report.usage)
        }
        .boxed()
    }

    fn current_session_id(&self) -> Option<String> {
        self.snapshot().session_id
    }
}

/// What one CLI invocation told us besides its events
struct RunReport {
    success: bool,
    orphaned: bool,
    session_id: Option<String>,
    usage: Option<Usage>,
}

async fn run_prompt(
    config: &DirectCliConfig,
    args: Vec<String>,
    event_tx: mpsc::Sender<AgentEvent>,
) -> Result<RunReport> {
    tracing::debug!(?args, "Spawning Claude CLI");

    let mut child = ProcessCommand::new(&config.binary)
        .args(&args)
        .current_dir(&config.working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn Claude CLI")?;

    let stdout = child.stdout.take().context("Failed to capture stdout")?;
    let stderr = child.stderr.take().context("Failed to capture stderr")?;

    let orphaned = Arc::new(AtomicBool::new(false));
    let stderr_orphaned = Arc::clone(&orphaned);
    let stderr_tx = event_tx.clone();

    let stderr_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            tracing::warn!(stderr = %line, "Claude CLI stderr");

            if line.contains(ORPHANED_SESSION_MARKER) && !stderr_orphaned.swap(true, Ordering::SeqCst) {
                let _ = stderr_tx
                    .send(AgentEvent::Error {
                        code: ErrorCode::SessionOrphaned,
                        message: "Previous conversation not found; continuing in a new session"
                            .to_string(),
                        recoverable: true,
                    })
                    .await;
            }
        }
    });

    let mut parser = StreamParser::default();
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        let Ok(json) = serde_json::from_str::<Value>(&line) else {
            tracing::debug!(line = %line, "Skipping non-JSON CLI output");
            continue;
        };
        for event in parser.parse(&json) {
            if event_tx.send(event).await.is_err() {
                tracing::debug!("Event receiver closed, stopping stream");
                break;
            }
        }
    }

    let status = child.wait().await?;

    // Join stderr so the orphan flag is settled before we report
    if let Err(e) = stderr_handle.await {
        tracing::warn!(error = %e, "stderr reader task failed to complete");
    }

    let orphaned = orphaned.load(Ordering::SeqCst);
    if !status.success() && !orphaned {
        let _ = event_tx
            .send(AgentEvent::error(
                ErrorCode::BackendError,
                format!("CLI exited with status: {:?}", status.code()),
            ))
            .await;
    }

    Ok(RunReport {
        success: status.success() && !parser.saw_error,
        orphaned,
        session_id: parser.session_id,
        usage: parser.usage,
    })
}

/// Incremental parser for the CLI's stream-json output
#[derive(Debug, Default)]
pub struct StreamParser {
    /// Session id announced by the CLI's init line
    pub session_id: Option<String>,
    /// Usage reported by the final result line
    pub usage: Option<Usage>,
    /// Whether the result line reported an error
    pub saw_error: bool,
    tool_names: HashMap<String, String>,
}

impl StreamParser {
    /// Translate one JSON line into zero or more events
    pub fn parse(&mut self, json: &Value) -> Vec<AgentEvent> {
        let Some(event_type) = json.get("type").and_then(|t| t.as_str()) else {
            return vec![custom("unknown", json)];
        };

        match event_type {
            "system" => {
                if json.get("subtype").and_then(|s| s.as_str()) == Some("init") {
                    if let Some(session_id) = json.get("session_id").and_then(|s| s.as_str()) {
                        self.session_id = Some(session_id.to_string());
                    }
                }
                Vec::new()
            }
            "assistant" => self.parse_assistant(json),
            "user" => self.parse_tool_results(json),
            "result" => self.parse_result(json),
            other => vec![custom(other, json)],
        }
    }

    fn parse_assistant(&mut self, json: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for item in content_items(json) {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    let tool_name = str_field(item, "name").unwrap_or("unknown").to_string();
                    let id = str_field(item, "id").unwrap_or("unknown").to_string();
                    let args = item.get("input").cloned().unwrap_or(Value::Null);

                    tracing::info!(tool = %tool_name, id = %id, "Tool use detected");
                    self.tool_names.insert(id.clone(), tool_name.clone());
                    events.push(AgentEvent::ToolCallStarted { id, tool_name, args });
                }
                Some("text") => {
                    if let Some(text) = str_field(item, "text").filter(|t| !t.is_empty()) {
                        events.push(AgentEvent::AssistantText(text.to_string()));
                    }
                }
                _ => {}
            }
        }
        events
    }

    fn parse_tool_results(&mut self, json: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for item in content_items(json) {
            if item.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let id = str_field(item, "tool_use_id").unwrap_or("unknown").to_string();
            let tool_name = self
                .tool_names
                .remove(&id)
                .unwrap_or_else(|| "unknown".to_string());
            let is_error = item
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            events.push(AgentEvent::ToolCallFinished {
                id,
                tool_name,
                result_kind: ToolResultKind::from_success(!is_error),
                result_text: tool_result_text(item.get("content")),
            });
        }
        events
    }

    fn parse_result(&mut self, json: &Value) -> Vec<AgentEvent> {
        self.usage = extract_usage(json);
        if let Some(session_id) = str_field(json, "session_id") {
            self.session_id = Some(session_id.to_string());
        }

        let is_error = json
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !is_error {
            return Vec::new();
        }

        self.saw_error = true;
        let message = str_field(json, "error")
            .or_else(|| str_field(json, "result"))
            .unwrap_or("Unknown error")
            .to_string();

        let lower = message.to_lowercase();
        let code = if lower.contains("timeout") {
            ErrorCode::Timeout
        } else if lower.contains("rate limit") {
            ErrorCode::RateLimited
        } else if lower.contains("permission") {
            ErrorCode::PermissionDenied
        } else {
            ErrorCode::BackendError
        };

        vec![AgentEvent::Error {
            code,
            message,
            recoverable: false,
        }]
    }
}

fn custom(kind: &str, json: &Value) -> AgentEvent {
    AgentEvent::Custom {
        kind: format!("cli.{}", kind),
        payload: json.clone(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn content_items(json: &Value) -> impl Iterator<Item = &Value> {
    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
}

/// Tool results arrive either as a plain string or as a list of text blocks
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found_usage = false;

    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found_usage = true;
    }

    if let Some(usage_obj) = json.get("usage") {
        usage.input_tokens = usage_obj
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.output_tokens = usage_obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = usage_obj
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64());
        usage.cache_write_tokens = usage_obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found_usage = true;
    }

    found_usage.then_some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> DirectCliConfig {
        DirectCliConfig {
            binary: "claude".to_string(),
            sdk_url: None,
            working_dir: PathBuf::from("/tmp"),
            model: None,
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn test_cli_args_first_turn_uses_session_id() {
        let session = CliSession {
            session_id: Some("abc".to_string()),
            started: false,
            model: Some("sonnet".to_string()),
            system_prompt: Some("be brief".to_string()),
        };
        let args = cli_args(&config(), &session, "hello");
        let joined = args.join(" ");
        assert!(joined.contains("--session-id abc"));
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--append-system-prompt be brief"));
        assert_eq!(args.last().map(String::as_str), Some("hello"));
    }

    #[test]
    fn test_cli_args_continuation_uses_resume() {
        let session = CliSession {
            session_id: Some("abc".to_string()),
            started: true,
            model: None,
            system_prompt: Some("be brief".to_string()),
        };
        let mut cfg = config();
        cfg.sdk_url = Some("http://localhost:9000".to_string());
        let joined = cli_args(&cfg, &session, "again").join(" ");
        assert!(joined.contains("--resume abc"));
        assert!(joined.contains("--sdk-url http://localhost:9000"));
        assert!(!joined.contains("--append-system-prompt"));
    }

    #[test]
    fn test_parser_maps_tool_use_and_result() {
        let mut parser = StreamParser::default();
        let started = parser.parse(&json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Looking"},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"path": "a.rs"}}
            ]}
        }));
        assert_eq!(started.len(), 2);
        assert!(matches!(&started[0], AgentEvent::AssistantText(t) if t == "Looking"));

        let finished = parser.parse(&json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "fn main() {}"}], "is_error": false}
            ]}
        }));
        match &finished[0] {
            AgentEvent::ToolCallFinished {
                tool_name,
                result_kind,
                result_text,
                ..
            } => {
                assert_eq!(tool_name, "Read");
                assert_eq!(*result_kind, ToolResultKind::Success);
                assert_eq!(result_text, "fn main() {}");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parser_captures_session_and_usage() {
        let mut parser = StreamParser::default();
        assert!(parser
            .parse(&json!({"type": "system", "subtype": "init", "session_id": "s-1"}))
            .is_empty());
        let events = parser.parse(&json!({
            "type": "result",
            "is_error": false,
            "total_cost_usd": 0.5,
            "usage": {"input_tokens": 10, "output_tokens": 20}
        }));
        assert!(events.is_empty());
        assert_eq!(parser.session_id.as_deref(), Some("s-1"));
        let usage = parser.usage.unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cost_usd, Some(0.5));
    }

    #[test]
    fn test_parser_unknown_type_becomes_custom() {
        let mut parser = StreamParser::default();
        let events = parser.parse(&json!({"type": "rate_limit_event", "retry": 3}));
        assert!(matches!(&events[0], AgentEvent::Custom { kind, .. } if kind == "cli.rate_limit_event"));
    }

    #[test]
    fn test_parser_error_result_classified() {
        let mut parser = StreamParser::default();
        let events = parser.parse(&json!({"type": "result", "is_error": true, "error": "Rate limit exceeded"}));
        assert!(parser.saw_error);
        assert!(matches!(
            &events[0],
            AgentEvent::Error { code: ErrorCode::RateLimited, .. }
        ));
    }
}
