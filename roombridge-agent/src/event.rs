// ABOUTME: Event types emitted by an agent session over its lifetime.
// ABOUTME: Covers session lifecycle, prompt echo, tool calls, assistant text, errors and a Custom fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Events emitted by an agent session, in emission order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AgentEvent {
    /// A session was started or resumed
    SessionStarted {
        /// Backend-assigned session id, if one is known yet
        session_id: Option<String>,
        /// Where the session came from ("new", "resume")
        source: String,
        /// Prompt the session was primed with
        initial_prompt: Option<String>,
    },

    /// The session ended and no further events follow
    SessionEnded {
        reason: String,
    },

    /// The human prompt that opened the current turn
    PromptEcho {
        text: String,
    },

    /// Tool started execution
    ToolCallStarted {
        /// Unique identifier for this tool invocation
        id: String,
        /// Tool name (e.g., "Read", "Bash", "Edit")
        tool_name: String,
        /// Full input passed to the tool
        args: Value,
    },

    /// Tool completed execution
    ToolCallFinished {
        /// Matches the id from ToolCallStarted
        id: String,
        tool_name: String,
        result_kind: ToolResultKind,
        result_text: String,
    },

    /// Assistant text, streamed one block at a time
    AssistantText(String),

    /// The turn finished; carries the id to resume from next time
    TurnComplete {
        session_id: Option<String>,
        usage: Option<Usage>,
    },

    /// Error occurred during execution
    Error {
        /// Typed error code, shown as the error name
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Whether the error is recoverable (can retry)
        recoverable: bool,
    },

    /// Runtime output the bridge has no dedicated variant for
    Custom {
        /// Event kind (e.g., "cli.rate_limit_event")
        kind: String,
        /// Raw payload
        payload: Value,
    },
}

impl AgentEvent {
    /// Short name of the variant, used as a structured logging field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::PromptEcho { .. } => "prompt_echo",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallFinished { .. } => "tool_call_finished",
            Self::AssistantText(_) => "assistant_text",
            Self::TurnComplete { .. } => "turn_complete",
            Self::Error { .. } => "error",
            Self::Custom { .. } => "custom",
        }
    }

    /// Build an error event from any displayable failure
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            recoverable: false,
        }
    }
}

/// Outcome of a finished tool call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultKind {
    Success,
    Failure,
}

impl ToolResultKind {
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// Typed error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Request timed out
    Timeout,
    /// Rate limited by the backend
    RateLimited,
    /// Authentication failed
    AuthFailed,
    /// Session no longer exists
    SessionOrphaned,
    /// Tool execution failed
    ToolFailed,
    /// Permission denied for operation
    PermissionDenied,
    /// Turn was stopped before it finished
    Cancelled,
    /// Chat transport failure surfaced to the room
    TransportError,
    /// Backend-specific error
    BackendError,
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::RateLimited => "RateLimited",
            Self::AuthFailed => "AuthFailed",
            Self::SessionOrphaned => "SessionOrphaned",
            Self::ToolFailed => "ToolFailed",
            Self::PermissionDenied => "PermissionDenied",
            Self::Cancelled => "Cancelled",
            Self::TransportError => "TransportError",
            Self::BackendError => "BackendError",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Token usage and cost tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens generated
    pub output_tokens: u64,
    /// Tokens read from cache
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to cache
    pub cache_write_tokens: Option<u64>,
    /// Total cost in USD
    pub cost_usd: Option<f64>,
}
