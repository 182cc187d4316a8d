// ABOUTME: AgentHandle provides a Send+Sync, session-scoped wrapper around a backend.
// ABOUTME: Commands go to a worker task that serializes turns and owns the session event stream.

use crate::event::{AgentEvent, ErrorCode};
use crate::traits::{AgentBackend, ResumeOutcome};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Capacity of the session-wide event channel
const EVENT_BUFFER: usize = 2048;

/// Commands sent from AgentHandle to the backend worker
#[derive(Debug)]
pub enum Command {
    StartSession {
        model: String,
        initial_prompt: Option<String>,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    ResumeSession {
        session_id: String,
        reply: oneshot::Sender<Result<ResumeOutcome>>,
    },
    SubmitTurn {
        text: String,
        /// Answered once the backend has taken the turn
        accepted: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    EndSession {
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Send + Sync handle the bridge interacts with.
///
/// Internally communicates with a worker task that runs the actual backend.
/// All events of the session, across turns, flow through one
/// [`EventReceiver`] obtained with [`AgentHandle::events`].
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    events: Arc<Mutex<Option<mpsc::Receiver<AgentEvent>>>>,
    name: &'static str,
}

impl AgentHandle {
    /// Spawn a worker task for `backend` and return a handle to it
    pub fn spawn<B: AgentBackend>(backend: B) -> Self {
        let name = backend.name();
        let (tx, rx) = mpsc::channel::<Command>(32);
        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(EVENT_BUFFER);

        tokio::spawn(run_worker(Arc::new(backend), rx, event_tx));

        Self {
            tx,
            events: Arc::new(Mutex::new(Some(event_rx))),
            name,
        }
    }

    /// Get the backend name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take the session event stream. Only the first caller gets it.
    pub fn events(&self) -> Option<EventReceiver> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(EventReceiver::new)
    }

    /// Start a fresh session
    pub async fn start_session(
        &self,
        model: &str,
        initial_prompt: Option<&str>,
    ) -> Result<Option<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::StartSession {
            model: model.to_string(),
            initial_prompt: initial_prompt.map(str::to_string),
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| anyhow!("Backend worker dropped reply channel"))?
    }

    /// Reattach to a persisted session
    pub async fn resume_session(&self, session_id: &str) -> Result<ResumeOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::ResumeSession {
            session_id: session_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| anyhow!("Backend worker dropped reply channel"))?
    }

    /// Submit one turn. Returns once the backend has taken it, which only
    /// happens after the previous turn has finished.
    pub async fn submit_turn(&self, text: &str) -> Result<()> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.send(Command::SubmitTurn {
            text: text.to_string(),
            accepted: accepted_tx,
        })
        .await?;
        accepted_rx
            .await
            .map_err(|_| anyhow!("Backend worker dropped reply channel"))?
    }

    /// Force-stop the in-flight turn, if any
    pub async fn cancel(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Cancel { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| anyhow!("Backend worker dropped reply channel"))?
    }

    /// Wait for the in-flight turn, emit SessionEnded and close the event stream
    pub async fn end_session(&self, reason: &str) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::EndSession {
            reason: reason.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| anyhow!("Backend worker dropped reply channel"))?
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("Backend worker closed"))
    }
}

async fn run_worker<B: AgentBackend>(
    backend: Arc<B>,
    mut rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<AgentEvent>,
) {
    // Held by whichever task is running a turn (or ending the session)
    let turn_lock = Arc::new(tokio::sync::Mutex::new(()));
    let current_turn = Arc::new(Mutex::new(CancellationToken::new()));
    let mut events = Some(event_tx);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::StartSession {
                model,
                initial_prompt,
                reply,
            } => {
                let Some(events) = events.as_ref() else {
                    let _ = reply.send(Err(anyhow!("Session already ended")));
                    continue;
                };
                let result = backend
                    .new_session(&model, initial_prompt.as_deref())
                    .await;
                if let Ok(session_id) = &result {
                    tracing::info!(
                        backend = backend.name(),
                        session_id = session_id.as_deref().unwrap_or("<pending>"),
                        model = %model,
                        "Agent session started"
                    );
                    let _ = events
                        .send(AgentEvent::SessionStarted {
                            session_id: session_id.clone(),
                            source: "new".to_string(),
                            initial_prompt,
                        })
                        .await;
                }
                let _ = reply.send(result);
            }
            Command::ResumeSession { session_id, reply } => {
                let Some(events) = events.as_ref() else {
                    let _ = reply.send(Err(anyhow!("Session already ended")));
                    continue;
                };
                let result = backend.load_session(&session_id).await;
                if let Ok(ResumeOutcome::Resumed) = &result {
                    tracing::info!(backend = backend.name(), %session_id, "Agent session resumed");
                    let _ = events
                        .send(AgentEvent::SessionStarted {
                            session_id: Some(session_id),
                            source: "resume".to_string(),
                            initial_prompt: None,
                        })
                        .await;
                }
                let _ = reply.send(result);
            }
            Command::SubmitTurn { text, accepted } => {
                let Some(events) = events.clone() else {
                    let _ = accepted.send(Err(anyhow!("Session already ended")));
                    continue;
                };
                let backend = Arc::clone(&backend);
                let turn_lock = Arc::clone(&turn_lock);
                let current_turn = Arc::clone(&current_turn);
                tokio::spawn(async move {
                    let _guard = turn_lock.lock_owned().await;
                    let token = {
                        let mut slot = current_turn.lock().unwrap_or_else(|e| e.into_inner());
                        *slot = CancellationToken::new();
                        slot.clone()
                    };
                    // Submitter gave up waiting (bridge draining): drop the turn
                    if accepted.send(Ok(())).is_err() {
                        tracing::debug!(backend = backend.name(), "Turn abandoned before it started");
                        return;
                    }
                    run_turn(backend.as_ref(), &text, events, token).await;
                });
            }
            Command::Cancel { reply } => {
                current_turn
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .cancel();
                let _ = reply.send(Ok(()));
            }
            Command::EndSession { reason, reply } => {
                // Dropping the worker's sender lets the stream close once the
                // remaining turn tasks finish.
                let Some(events) = events.take() else {
                    let _ = reply.send(Ok(()));
                    continue;
                };
                let turn_lock = Arc::clone(&turn_lock);
                tokio::spawn(async move {
                    let _guard = turn_lock.lock_owned().await;
                    tracing::info!(%reason, "Agent session ending");
                    let _ = events.send(AgentEvent::SessionEnded { reason }).await;
                    let _ = reply.send(Ok(()));
                });
            }
        }
    }

    tracing::debug!(backend = backend.name(), "Agent worker stopped");
}

async fn run_turn<B: AgentBackend>(
    backend: &B,
    text: &str,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) {
    let _ = events
        .send(AgentEvent::PromptEcho {
            text: text.to_string(),
        })
        .await;

    let outcome = tokio::select! {
        result = backend.prompt(text, events.clone()) => result,
        _ = cancel.cancelled() => {
            tracing::warn!(backend = backend.name(), "Turn cancelled");
            let _ = events
                .send(AgentEvent::error(ErrorCode::Cancelled, "Turn was stopped before it finished"))
                .await;
            Ok(None)
        }
    };

    let usage = match outcome {
        Ok(usage) => usage,
        Err(e) => {
            tracing::error!(error = %e, backend = backend.name(), "Turn failed");
            let _ = events
                .send(AgentEvent::error(ErrorCode::BackendError, e.to_string()))
                .await;
            None
        }
    };

    let _ = events
        .send(AgentEvent::TurnComplete {
            session_id: backend.current_session_id(),
            usage,
        })
        .await;
}

/// Receiver for the session's event stream.
///
/// This is `Send` so it can be passed across async task boundaries.
pub struct EventReceiver {
    rx: mpsc::Receiver<AgentEvent>,
}

impl EventReceiver {
    /// Create a new EventReceiver wrapping the given channel
    pub fn new(rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event, or None if the stream is closed
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }
}
