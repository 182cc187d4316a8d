// ABOUTME: EventFormatter - renders agent events as markdown chat messages.
// ABOUTME: Pure and deterministic; previews are capped on character boundaries.

use crate::markup::truncate_str;
use roombridge_agent::{AgentEvent, ErrorCode, ToolResultKind};
use serde_json::Value;

/// Cap for tool-argument previews (chars)
pub const ARGS_PREVIEW_CHARS: usize = 500;
/// Cap for tool-result previews (chars)
pub const RESULT_PREVIEW_CHARS: usize = 1000;
/// Cap for generic payload renderings (chars)
pub const PAYLOAD_PREVIEW_CHARS: usize = 500;

/// Marker every error message starts with
pub const ERROR_MARKER: &str = "🚨";

#[derive(Debug, Clone)]
pub struct EventFormatter {
    pub args_cap: usize,
    pub result_cap: usize,
    pub payload_cap: usize,
}

impl Default for EventFormatter {
    fn default() -> Self {
        Self {
            args_cap: ARGS_PREVIEW_CHARS,
            result_cap: RESULT_PREVIEW_CHARS,
            payload_cap: PAYLOAD_PREVIEW_CHARS,
        }
    }
}

/// Compact JSON for arguments; bare strings are shown without quotes
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Wrap a preview in a fenced block so stray markdown in it stays inert
fn fenced(text: &str) -> String {
    let fence = if text.contains("```") { "````" } else { "```" };
    format!("{fence}\n{text}\n{fence}")
}

impl EventFormatter {
    /// Message body for `event`, or None for bookkeeping events that are not shown
    pub fn format(&self, event: &AgentEvent) -> Option<String> {
        let text = match event {
            AgentEvent::SessionStarted {
                source,
                initial_prompt,
                ..
            } => {
                let prompt = initial_prompt
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| truncate_str(p, self.args_cap))
                    .unwrap_or_else(|| "_none_".to_string());
                format!("▶️ **Session started** ({})\nPrompt: {}", source, prompt)
            }
            AgentEvent::SessionEnded { reason } => format!("⏹️ **Session ended**: {}", reason),
            AgentEvent::PromptEcho { text } => format!("💬 **Prompt:** {}", text),
            AgentEvent::ToolCallStarted {
                tool_name, args, ..
            } => {
                let preview = truncate_str(&render_value(args), self.args_cap);
                if preview.is_empty() {
                    format!("🔧 **{}**", tool_name)
                } else {
                    format!("🔧 **{}**\n{}", tool_name, fenced(&preview))
                }
            }
            AgentEvent::ToolCallFinished {
                tool_name,
                result_kind,
                result_text,
                ..
            } => {
                let (marker, verdict) = match result_kind {
                    ToolResultKind::Success => ("✅", "succeeded"),
                    ToolResultKind::Failure => ("⚠️", "failed"),
                };
                let preview = truncate_str(result_text.trim(), self.result_cap);
                if preview.is_empty() {
                    format!("{} **{}** {} (no output)", marker, tool_name, verdict)
                } else {
                    format!("{} **{}** {}\n{}", marker, tool_name, verdict, fenced(&preview))
                }
            }
            AgentEvent::AssistantText(text) => text.clone(),
            AgentEvent::Error { code, message, .. } => self.format_error(*code, message),
            AgentEvent::TurnComplete { .. } => return None,
            AgentEvent::Custom { kind, payload } => {
                let preview = truncate_str(&render_value(payload), self.payload_cap);
                format!("ℹ️ `{}`\n{}", kind, fenced(&preview))
            }
        };
        Some(text)
    }

    /// Error rendering, also used for bridge-side failures shown in the room
    pub fn format_error(&self, code: ErrorCode, message: &str) -> String {
        format!("{} **Error: {}** {}", ERROR_MARKER, code.name(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fmt(event: AgentEvent) -> String {
        EventFormatter::default().format(&event).unwrap()
    }

    #[test]
    fn test_session_started_without_prompt_uses_placeholder() {
        let out = fmt(AgentEvent::SessionStarted {
            session_id: None,
            source: "resume".to_string(),
            initial_prompt: Some("   ".to_string()),
        });
        assert!(out.contains("resume"));
        assert!(out.contains("_none_"));
    }

    #[test]
    fn test_session_ended_includes_reason() {
        assert!(fmt(AgentEvent::SessionEnded {
            reason: "shutdown".to_string()
        })
        .contains("shutdown"));
    }

    #[test]
    fn test_tool_call_started_caps_args() {
        let out = fmt(AgentEvent::ToolCallStarted {
            id: "t".to_string(),
            tool_name: "Write".to_string(),
            args: json!({"content": "x".repeat(2000)}),
        });
        assert!(out.contains("**Write**"));
        assert!(out.chars().count() < ARGS_PREVIEW_CHARS + 40);
    }

    #[test]
    fn test_tool_finished_markers_differ() {
        let ok = fmt(AgentEvent::ToolCallFinished {
            id: "t".to_string(),
            tool_name: "Bash".to_string(),
            result_kind: ToolResultKind::Success,
            result_text: "done".to_string(),
        });
        let bad = fmt(AgentEvent::ToolCallFinished {
            id: "t".to_string(),
            tool_name: "Bash".to_string(),
            result_kind: ToolResultKind::Failure,
            result_text: "exit 1".to_string(),
        });
        assert!(ok.starts_with("✅"));
        assert!(bad.starts_with("⚠️"));
        assert!(!ok.starts_with(ERROR_MARKER) && !bad.starts_with(ERROR_MARKER));
    }

    #[test]
    fn test_tool_finished_caps_multibyte_result() {
        let out = fmt(AgentEvent::ToolCallFinished {
            id: "t".to_string(),
            tool_name: "Read".to_string(),
            result_kind: ToolResultKind::Success,
            result_text: "日".repeat(5000),
        });
        let preview = out
            .split_once("```\n")
            .and_then(|(_, rest)| rest.rsplit_once("\n```"))
            .map(|(body, _)| body)
            .unwrap();
        assert!(preview.chars().count() <= RESULT_PREVIEW_CHARS);
        assert!(preview.ends_with("..."));
        assert!(preview.starts_with("日日日"));
    }

    #[test]
    fn test_error_is_marked_with_name_and_message() {
        let out = fmt(AgentEvent::error(ErrorCode::RateLimited, "slow down"));
        assert!(out.starts_with(ERROR_MARKER));
        assert!(out.contains("RateLimited"));
        assert!(out.contains("slow down"));
    }

    #[test]
    fn test_custom_event_is_rendered_not_dropped() {
        let out = fmt(AgentEvent::Custom {
            kind: "cli.rate_limit_event".to_string(),
            payload: json!({"blob": "y".repeat(5000)}),
        });
        assert!(out.contains("cli.rate_limit_event"));
        assert!(out.chars().count() < PAYLOAD_PREVIEW_CHARS + 60);
    }

    #[test]
    fn test_turn_complete_is_not_shown() {
        let event = AgentEvent::TurnComplete {
            session_id: Some("s".to_string()),
            usage: None,
        };
        assert!(EventFormatter::default().format(&event).is_none());
    }

    #[test]
    fn test_formatting_is_deterministic() {
        let event = AgentEvent::AssistantText("same".to_string());
        assert_eq!(fmt(event.clone()), fmt(event));
    }
}
