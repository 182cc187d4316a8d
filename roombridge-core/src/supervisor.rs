// ABOUTME: BridgeSupervisor - owns the one agent session for this process's working directory.
// ABOUTME: Drives Initializing -> Resolving -> Running -> Draining -> Terminated (or Failed).

use crate::backoff::BackoffConfig;
use crate::config::Config;
use crate::error::BridgeError;
use crate::relay::{InboundRelay, OutboundRelay, OutboundSummary};
use crate::room_directory::{RoomDirectory, RoomStore};
use crate::session::SessionStore;
use crate::traits::{ChatTransport, MessageContent};
use crate::workdir::WorkingDirectory;
use roombridge_agent::{AgentHandle, ResumeOutcome};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for flushing outbound messages once the session has ended
const FLUSH_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Initializing,
    Resolving,
    Running,
    Draining,
    Terminated,
    Failed,
}

/// The live conversation this process runs
#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub directory: WorkingDirectory,
    pub room_id: String,
    /// None until the agent assigns one
    pub session_id: Option<String>,
    pub authorized_sender: String,
    pub live: bool,
}

pub type SharedSession = Arc<Mutex<BridgeSession>>;

#[derive(Debug)]
pub enum BridgeOutcome {
    Clean,
    Failed(BridgeError),
}

impl BridgeOutcome {
    /// Process exit status: 0 clean, 2 bad configuration, 1 anything else
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Failed(BridgeError::Configuration(_)) => 2,
            Self::Failed(_) => 1,
        }
    }
}

pub struct BridgeSupervisor<T: ChatTransport> {
    config: Config,
    transport: Arc<T>,
    agent: AgentHandle,
    state: watch::Sender<BridgeState>,
    retry_backoff: BackoffConfig,
    room_lease: Option<(Duration, Duration)>,
}

impl<T: ChatTransport> BridgeSupervisor<T> {
    pub fn new(config: Config, transport: Arc<T>, agent: AgentHandle) -> Self {
        let (state, _) = watch::channel(BridgeState::Initializing);
        Self {
            config,
            transport,
            agent,
            state,
            retry_backoff: BackoffConfig::default(),
            room_lease: None,
        }
    }

    /// Delays used for subscription, send and room-creation retries
    pub fn with_retry_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Cross-process room-creation lease and poll interval
    pub fn with_room_lease(mut self, lease: Duration, poll_interval: Duration) -> Self {
        self.room_lease = Some((lease, poll_interval));
        self
    }

    /// Watch the state machine
    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: BridgeState) {
        tracing::info!(state = ?next, "Bridge state");
        self.state.send_replace(next);
    }

    fn fail(&self, error: BridgeError) -> BridgeOutcome {
        tracing::error!(category = error.category(), error = %error, "Bridge failed");
        self.set_state(BridgeState::Failed);
        BridgeOutcome::Failed(error)
    }

    /// Run until `shutdown` fires or something unrecoverable happens
    pub async fn run(self, shutdown: CancellationToken) -> BridgeOutcome {
        // Initializing
        self.set_state(BridgeState::Initializing);
        let directory = match self
            .config
            .bridge
            .working_dir()
            .and_then(WorkingDirectory::new)
        {
            Ok(dir) => dir,
            Err(e) => return self.fail(BridgeError::configuration(e)),
        };
        let state_dir = self.config.bridge.state_dir();

        let sessions = match SessionStore::open(&state_dir) {
            Ok(store) => store,
            Err(e) if !e.is_fatal_at_startup() => {
                tracing::warn!(error = %e, "Session store unavailable; sessions will not survive a restart");
                match SessionStore::in_memory() {
                    Ok(store) => store,
                    Err(e) => return self.fail(e),
                }
            }
            Err(e) => return self.fail(e),
        };
        let room_store = match RoomStore::open(&state_dir) {
            Ok(store) => store,
            Err(e) => return self.fail(e),
        };

        let me = match self.transport.login().await {
            Ok(user) => user,
            Err(e) => return self.fail(BridgeError::transport(e.context("Login failed"))),
        };
        tracing::info!(user = %me.id, transport = self.transport.name(), directory = %directory, "Logged in");

        // Resolving
        self.set_state(BridgeState::Resolving);
        let admin = self.config.matrix.admin_user.clone();
        let mut rooms = RoomDirectory::new(Arc::clone(&self.transport), room_store, admin.clone())
            .with_room_prefix(self.config.matrix.room_prefix.clone())
            .with_create_attempts(
                self.config.bridge.room_create_attempts,
                self.retry_backoff.clone(),
            );
        if let Some((lease, poll)) = self.room_lease {
            rooms = rooms.with_lease(lease, poll);
        }
        let room_id = match rooms.resolve(&directory).await {
            Ok(room_id) => room_id,
            Err(e) => return self.fail(e),
        };
        let prior = sessions.load(&directory);
        tracing::info!(%room_id, prior_session = prior.as_deref().unwrap_or("none"), "Resolved room");

        let session: SharedSession = Arc::new(Mutex::new(BridgeSession {
            directory: directory.clone(),
            room_id: room_id.clone(),
            session_id: None,
            authorized_sender: admin.clone(),
            live: false,
        }));

        // Running
        self.set_state(BridgeState::Running);
        let Some(events) = self.agent.events() else {
            return self.fail(BridgeError::Agent(
                "agent event stream was already taken".to_string(),
            ));
        };

        let outbound_relay = OutboundRelay::new(
            Arc::clone(&self.transport),
            sessions.clone(),
            Arc::clone(&session),
        )
        .with_send_policy(
            self.config.bridge.send_timeout(),
            self.config.bridge.send_attempts,
            self.retry_backoff.clone(),
        )
        .with_max_chars(self.config.bridge.max_message_chars);
        let mut outbound: JoinHandle<OutboundSummary> = tokio::spawn(outbound_relay.run(events));

        let resumed = match self.start_agent(&directory, prior, &sessions, &session).await {
            Ok(resumed) => resumed,
            Err(e) => {
                outbound.abort();
                return self.fail(e);
            }
        };
        set_live(&session, true);

        if self.config.bridge.announce {
            let text = format!(
                "🟢 **Bridge online** for `{}`\nModel: {} · {}",
                directory,
                self.config.agent.model,
                if resumed { "resumed session" } else { "new session" }
            );
            self.announce(&room_id, text).await;
        }

        let inbound_cancel = CancellationToken::new();
        let inbound_relay = InboundRelay::new(
            Arc::clone(&self.transport),
            self.agent.clone(),
            room_id.clone(),
            me.id.clone(),
            admin,
        )
        .with_dedup(self.config.bridge.dedupe_events)
        .with_backoff(
            self.retry_backoff
                .clone()
                .with_max_retries(self.config.bridge.subscribe_attempts),
        );
        let mut inbound = tokio::spawn(inbound_relay.run(inbound_cancel.clone()));

        let mut failure: Option<BridgeError> = None;
        let mut inbound_done = false;
        let mut outbound_done = false;
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested");
            }
            result = &mut inbound => {
                inbound_done = true;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failure = Some(e),
                    Err(e) => failure = Some(BridgeError::Transport(format!("inbound relay crashed: {}", e))),
                }
            }
            result = &mut outbound => {
                outbound_done = true;
                let summary = result.unwrap_or_default();
                failure = Some(BridgeError::Agent(format!(
                    "agent event stream closed unexpectedly (session ended: {})",
                    summary.session_ended
                )));
            }
        }

        // Draining
        self.set_state(BridgeState::Draining);
        inbound_cancel.cancel();
        if !inbound_done && tokio::time::timeout(FLUSH_WINDOW, &mut inbound).await.is_err() {
            tracing::warn!("Inbound relay did not stop in time; aborting it");
            inbound.abort();
        }

        let grace = self.config.bridge.shutdown_grace();
        match tokio::time::timeout(grace, self.agent.end_session("bridge shutting down")).await {
            Ok(Ok(())) => tracing::info!("Agent session ended cleanly"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Agent session did not end cleanly"),
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "In-flight turn outlived the grace period; forcing it to stop");
                if let Err(e) = self.agent.cancel().await {
                    tracing::warn!(error = %e, "Failed to cancel in-flight turn");
                }
                let last_known = session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .session_id
                    .clone();
                if let Some(session_id) = last_known {
                    if let Err(e) = sessions.save(&directory, &session_id) {
                        tracing::warn!(error = %e, "Best-effort session save failed");
                    }
                }
            }
        }

        if !outbound_done {
            match tokio::time::timeout(FLUSH_WINDOW, &mut outbound).await {
                Ok(Ok(summary)) => tracing::info!(
                    delivered = summary.delivered,
                    failed = summary.failed,
                    "Outbound flushed"
                ),
                Ok(Err(e)) => tracing::warn!(error = %e, "Outbound relay crashed"),
                Err(_) => {
                    tracing::warn!("Outbound relay did not flush in time; aborting it");
                    outbound.abort();
                }
            }
        }
        set_live(&session, false);

        if self.config.bridge.announce {
            self.announce(&room_id, "🔴 **Bridge offline**".to_string()).await;
        }
        if let Err(e) = self.transport.shutdown().await {
            tracing::warn!(error = %e, "Transport shutdown failed");
        }

        match failure {
            Some(error) => {
                tracing::error!(category = error.category(), error = %error, "Bridge stopped after failure");
                self.set_state(BridgeState::Terminated);
                BridgeOutcome::Failed(error)
            }
            None => {
                self.set_state(BridgeState::Terminated);
                BridgeOutcome::Clean
            }
        }
    }

    /// Resume the prior session when possible, otherwise start fresh.
    /// Returns whether the prior session was resumed.
    async fn start_agent(
        &self,
        directory: &WorkingDirectory,
        prior: Option<String>,
        sessions: &SessionStore,
        session: &SharedSession,
    ) -> Result<bool, BridgeError> {
        if let Some(prior) = prior {
            match self.agent.resume_session(&prior).await {
                Ok(ResumeOutcome::Resumed) => {
                    tracing::info!(session_id = %prior, "Resumed agent session");
                    set_session_id(session, Some(prior));
                    return Ok(true);
                }
                Ok(ResumeOutcome::Rejected { reason }) => {
                    tracing::warn!(session_id = %prior, %reason, "Agent rejected stored session; starting fresh");
                }
                Err(e) => {
                    tracing::warn!(session_id = %prior, error = %e, "Resume failed; starting fresh");
                }
            }

            let fresh = self.start_fresh(directory).await?;
            // Overwrite the stale record right away
            let overwrite = match &fresh {
                Some(id) => sessions.save(directory, id),
                None => sessions.clear(directory),
            };
            if let Err(e) = overwrite {
                tracing::warn!(error = %e, "Failed to overwrite stale session record");
            }
            set_session_id(session, fresh);
            return Ok(false);
        }

        let fresh = self.start_fresh(directory).await?;
        if let Some(id) = &fresh {
            if let Err(e) = sessions.save(directory, id) {
                tracing::warn!(error = %e, "Failed to save new session id");
            }
        }
        set_session_id(session, fresh);
        Ok(false)
    }

    async fn start_fresh(&self, directory: &WorkingDirectory) -> Result<Option<String>, BridgeError> {
        let prompt = self.config.agent.initial_prompt(directory.path());
        self.agent
            .start_session(&self.config.agent.model, Some(&prompt))
            .await
            .map_err(|e| BridgeError::agent(e.context("Failed to start agent session")))
    }

    async fn announce(&self, room_id: &str, text: String) {
        let send = self.transport.send(room_id, MessageContent::plain(text));
        match tokio::time::timeout(self.config.bridge.send_timeout(), send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Announcement failed"),
            Err(_) => tracing::warn!("Announcement timed out"),
        }
    }
}

fn set_live(session: &SharedSession, live: bool) {
    session.lock().unwrap_or_else(|e| e.into_inner()).live = live;
}

fn set_session_id(session: &SharedSession, session_id: Option<String>) {
    let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
    if session_id.is_some() {
        session.session_id = session_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(BridgeOutcome::Clean.exit_code(), 0);
        assert_eq!(
            BridgeOutcome::Failed(BridgeError::Configuration("x".into())).exit_code(),
            2
        );
        assert_eq!(
            BridgeOutcome::Failed(BridgeError::Transport("x".into())).exit_code(),
            1
        );
    }
}
