// ABOUTME: Chat transport capability the bridge consumes: login, rooms, invites, subscribe, send.
// ABOUTME: Data types for inbound chat events and outbound message content.

use anyhow::Result;
use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

// =============================================================================
// Message Content Types
// =============================================================================

/// Content that can be sent to a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Plain text message
    Plain(String),
    /// Message with both plain text and HTML formatting
    Html { plain: String, html: String },
}

impl MessageContent {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain(text.into())
    }

    pub fn html(plain: impl Into<String>, html: impl Into<String>) -> Self {
        Self::Html {
            plain: plain.into(),
            html: html.into(),
        }
    }

    /// The plain-text body, whichever variant this is
    pub fn text(&self) -> &str {
        match self {
            Self::Plain(text) => text,
            Self::Html { plain, .. } => plain,
        }
    }
}

// =============================================================================
// Identities and Events
// =============================================================================

/// Identity of a chat user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatUser {
    /// Unique identifier (e.g., @user:matrix.org)
    pub id: String,
    pub display_name: Option<String>,
}

impl ChatUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }
}

/// Inbound message from a room subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Transport-provided id, used for de-duplication
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub body: String,
    /// HTML body when the sender used rich formatting
    pub formatted: Option<String>,
    /// Event this message replies to, when the client marked it as a reply
    pub in_reply_to: Option<String>,
    /// Milliseconds since Unix epoch
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomVisibility {
    Private,
    Public,
}

/// Parameters for a new room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    pub name: String,
    pub topic: String,
    pub visibility: RoomVisibility,
}

/// Boxed stream type for room events
pub type EventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

// =============================================================================
// Transport capability
// =============================================================================

/// Chat transport the bridge drives. Credentials are supplied at construction.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    /// Transport name for logging (e.g., "matrix", "mock")
    fn name(&self) -> &'static str;

    /// Authenticate and return the bot's own identity
    async fn login(&self) -> Result<ChatUser>;

    /// Create a room and return its id
    async fn create_room(&self, spec: &RoomSpec) -> Result<String>;

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()>;

    /// Live stream of new messages in one room. History from before the
    /// call is never replayed.
    async fn subscribe(&self, room_id: &str) -> Result<EventStream>;

    async fn send(&self, room_id: &str, content: MessageContent) -> Result<()>;

    /// Stop background work (sync loops, connections)
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
