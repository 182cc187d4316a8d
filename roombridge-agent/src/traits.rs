// ABOUTME: Core AgentBackend trait that all backends implement.
// ABOUTME: Defines session start/resume and single-turn prompt execution.

use crate::event::{AgentEvent, Usage};
use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Result of asking a backend to reattach to a persisted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    /// The backend does not recognize the id (expired, foreign, malformed)
    Rejected { reason: String },
}

/// Core trait that all agent backends implement.
///
/// A backend owns exactly one conversation at a time. The worker behind
/// [`crate::AgentHandle`] guarantees `prompt` is never called concurrently,
/// and drops the returned future to force-stop a turn.
pub trait AgentBackend: Send + Sync + 'static {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Start a fresh session. Returns the session id if the backend assigns
    /// one up front; otherwise the id arrives with the first completed turn.
    fn new_session<'a>(
        &'a self,
        model: &'a str,
        initial_prompt: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>>>;

    /// Reattach to a previously persisted session
    fn load_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<ResumeOutcome>>;

    /// Run one turn, streaming events into `events` as they happen.
    ///
    /// Returns token usage when the backend reports it.
    fn prompt<'a>(
        &'a self,
        text: &'a str,
        events: mpsc::Sender<AgentEvent>,
    ) -> BoxFuture<'a, Result<Option<Usage>>>;

    /// Id that a future process should resume from, if any
    fn current_session_id(&self) -> Option<String>;
}
