// ABOUTME: Mock backend for testing - returns pre-configured responses.
// ABOUTME: Allows deterministic tests without spawning real agent processes.
//!
//! # Example
//!
//! ```no_run
//! use roombridge_agent::backends::mock::MockBackend;
//! use roombridge_agent::AgentEvent;
//!
//! # async fn example() {
//! let handle = MockBackend::new()
//!     .on_prompt("hello")
//!     .respond_text("Hi there!")
//!     .into_handle();
//! let mut events = handle.events().unwrap();
//!
//! handle.start_session("sonnet", None).await.unwrap();
//! handle.submit_turn("hello").await.unwrap();
//!
//! while let Some(event) = events.recv().await {
//!     if let AgentEvent::AssistantText(text) = event {
//!         assert_eq!(text, "Hi there!");
//!         break;
//!     }
//! }
//! # }
//! ```

use crate::event::{AgentEvent, ErrorCode, Usage};
use crate::handle::AgentHandle;
use crate::traits::{AgentBackend, ResumeOutcome};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Mock backend for testing
pub struct MockBackend {
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    reject_resume: Option<String>,
    turn_delay: Option<Duration>,
    session_counter: AtomicU64,
    current: Mutex<Option<String>>,
}

struct Expectation {
    pattern: String,
    events: Vec<AgentEvent>,
}

impl MockBackend {
    /// Create a new mock backend with no expectations
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(VecDeque::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            reject_resume: None,
            turn_delay: None,
            session_counter: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    /// Set up an expectation for a prompt matching the given pattern
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            backend: self,
            pattern: pattern.to_string(),
        }
    }

    /// Reject every resume attempt with the given reason
    pub fn reject_resume(mut self, reason: &str) -> Self {
        self.reject_resume = Some(reason.to_string());
        self
    }

    /// Sleep this long inside every turn before emitting events
    pub fn with_turn_delay(mut self, delay: Duration) -> Self {
        self.turn_delay = Some(delay);
        self
    }

    /// Shared log of every prompt text the backend received, in order
    pub fn prompt_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }

    /// Convert this backend into an AgentHandle
    pub fn into_handle(self) -> AgentHandle {
        AgentHandle::spawn(self)
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::BackendFactory {
        Box::new(|_config| Ok(MockBackend::new().into_handle()))
    }

    fn take_events(&self, text: &str) -> Option<Vec<AgentEvent>> {
        // FIFO preference: check the front first, fall back to searching the
        // queue if the front doesn't match.
        let mut exp = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(front) = exp.front() {
            if text.contains(&front.pattern) {
                return exp.pop_front().map(|e| e.events);
            }
        }
        exp.iter()
            .position(|e| text.contains(&e.pattern))
            .and_then(|i| exp.remove(i))
            .map(|e| e.events)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn new_session<'a>(
        &'a self,
        _model: &'a str,
        _initial_prompt: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        async move {
            let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = format!("mock-session-{}", n);
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(session_id.clone());
            Ok(Some(session_id))
        }
        .boxed()
    }

    fn load_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<ResumeOutcome>> {
        async move {
            if let Some(reason) = &self.reject_resume {
                return Ok(ResumeOutcome::Rejected {
                    reason: reason.clone(),
                });
            }
            *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(session_id.to_string());
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
            self.prompts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(text.to_string());

            if let Some(delay) = self.turn_delay {
                tokio::time::sleep(delay).await;
            }

            let scripted = self.take_events(text).unwrap_or_else(|| {
                vec![AgentEvent::AssistantText(format!(
                    "Mock: no expectation for '{}'",
                    text
                ))]
            });

            for event in scripted {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None)
        }
        .boxed()
    }

    fn current_session_id(&self) -> Option<String> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    backend: MockBackend,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a list of events
    pub fn respond_with(self, events: Vec<AgentEvent>) -> MockBackend {
        self.backend
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                events,
            });
        self.backend
    }

    /// Respond with a single block of assistant text
    pub fn respond_text(self, text: &str) -> MockBackend {
        self.respond_with(vec![AgentEvent::AssistantText(text.to_string())])
    }

    /// Respond with an error
    pub fn respond_error(self, code: ErrorCode, message: &str) -> MockBackend {
        self.respond_with(vec![AgentEvent::error(code, message)])
    }
}
