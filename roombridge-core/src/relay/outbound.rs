// ABOUTME: OutboundRelay - posts formatted agent events to the room in emission order.
// ABOUTME: Sends are bounded by a timeout and retried; session ids are persisted as turns complete.

use crate::backoff::{BackoffConfig, BackoffState};
use crate::format::EventFormatter;
use crate::markup::{chunk_message, label_parts, markdown_to_html, MAX_CHUNK_SIZE};
use crate::session::SessionStore;
use crate::supervisor::SharedSession;
use crate::traits::{ChatTransport, MessageContent};
use roombridge_agent::{AgentEvent, EventReceiver};
use std::sync::Arc;
use std::time::Duration;

/// Attempts for one best-effort session save
const SAVE_ATTEMPTS: u32 = 3;

/// Delivery totals for one relay run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundSummary {
    pub delivered: usize,
    pub failed: usize,
    /// The agent ended the session (as opposed to the stream just closing)
    pub session_ended: bool,
}

pub struct OutboundRelay<T: ChatTransport> {
    transport: Arc<T>,
    sessions: SessionStore,
    session: SharedSession,
    formatter: EventFormatter,
    send_timeout: Duration,
    send_attempts: u32,
    max_chars: usize,
    backoff: BackoffConfig,
}

impl<T: ChatTransport> OutboundRelay<T> {
    pub fn new(transport: Arc<T>, sessions: SessionStore, session: SharedSession) -> Self {
        Self {
            transport,
            sessions,
            session,
            formatter: EventFormatter::default(),
            send_timeout: Duration::from_secs(30),
            send_attempts: 3,
            max_chars: MAX_CHUNK_SIZE,
            backoff: BackoffConfig::sends(),
        }
    }

    pub fn with_send_policy(mut self, timeout: Duration, attempts: u32, backoff: BackoffConfig) -> Self {
        self.send_timeout = timeout;
        self.send_attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }

    /// Relay until the session ends or the event stream closes
    pub async fn run(self, mut events: EventReceiver) -> OutboundSummary {
        let room_id = self.session.lock().unwrap_or_else(|e| e.into_inner()).room_id.clone();
        let mut summary = OutboundSummary::default();

        while let Some(event) = events.recv().await {
            tracing::debug!(kind = event.kind(), "Agent event");

            match &event {
                AgentEvent::SessionStarted {
                    session_id: Some(id),
                    ..
                }
                | AgentEvent::TurnComplete {
                    session_id: Some(id),
                    ..
                } => self.record_session(id).await,
                _ => {}
            }

            if let Some(body) = self.formatter.format(&event) {
                for part in label_parts(chunk_message(&body, self.max_chars)) {
                    if self.deliver(&room_id, part).await {
                        summary.delivered += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
            }

            if let AgentEvent::SessionEnded { reason } = &event {
                tracing::info!(%reason, "Agent session ended; outbound relay stopping");
                summary.session_ended = true;
                break;
            }
        }

        tracing::info!(
            room_id = %room_id,
            delivered = summary.delivered,
            failed = summary.failed,
            "Outbound relay stopped"
        );
        summary
    }

    /// Keep the live session id current and persist it for the next restart.
    /// SQLite writes may wait on the busy timeout, so they run on the blocking pool.
    async fn record_session(&self, session_id: &str) {
        let directory = {
            let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            session.session_id = Some(session_id.to_string());
            session.directory.clone()
        };

        let mut backoff = BackoffState::new(BackoffConfig::sends());
        for attempt in 1..=SAVE_ATTEMPTS {
            let sessions = self.sessions.clone();
            let directory = directory.clone();
            let id = session_id.to_string();
            let error = match tokio::task::spawn_blocking(move || sessions.save(&directory, &id)).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("save task failed: {}", e),
            };
            tracing::warn!(%error, %session_id, attempt, "Failed to persist session id");

            if attempt < SAVE_ATTEMPTS {
                if let Some(delay) = backoff.record_failure() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        tracing::error!(%session_id, "Giving up persisting session id; resume may start fresh");
    }

    /// One message, with timeout and retries. False when it was finally dropped.
    async fn deliver(&self, room_id: &str, body: String) -> bool {
        let content = MessageContent::html(body.clone(), markdown_to_html(&body));
        let mut backoff = BackoffState::new(self.backoff.clone());

        for attempt in 1..=self.send_attempts {
            let outcome =
                tokio::time::timeout(self.send_timeout, self.transport.send(room_id, content.clone()))
                    .await;
            let error = match outcome {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("send timed out after {:?}", self.send_timeout),
            };
            tracing::warn!(%error, %room_id, attempt, max_attempts = self.send_attempts, "Send failed");

            if attempt < self.send_attempts {
                if let Some(delay) = backoff.record_failure() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        tracing::error!(%room_id, chars = body.chars().count(), "Dropping message after repeated send failures");
        false
    }
}
