// ABOUTME: InboundRelay - forwards the authorized sender's room messages to the agent as turns.
// ABOUTME: Turns are handed off one at a time, in arrival order; dropped subscriptions are re-established.

use crate::backoff::{BackoffConfig, BackoffState};
use crate::dedup::EventDeduplicator;
use crate::error::BridgeError;
use crate::format::EventFormatter;
use crate::markup::strip_reply_fallback;
use crate::traits::{ChatEvent, ChatTransport, EventStream, MessageContent};
use roombridge_agent::{AgentHandle, ErrorCode};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Why an inbound event was not relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    OtherRoom,
    OwnMessage,
    Unauthorized,
    Duplicate,
    Empty,
}

pub struct InboundRelay<T: ChatTransport> {
    transport: Arc<T>,
    agent: AgentHandle,
    room_id: String,
    bot_user: String,
    authorized_sender: String,
    dedup: Option<EventDeduplicator>,
    backoff: BackoffConfig,
    formatter: EventFormatter,
}

impl<T: ChatTransport> InboundRelay<T> {
    pub fn new(
        transport: Arc<T>,
        agent: AgentHandle,
        room_id: impl Into<String>,
        bot_user: impl Into<String>,
        authorized_sender: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            agent,
            room_id: room_id.into(),
            bot_user: bot_user.into(),
            authorized_sender: authorized_sender.into(),
            dedup: Some(EventDeduplicator::default()),
            backoff: BackoffConfig::subscriptions(5),
            formatter: EventFormatter::default(),
        }
    }

    /// Turn transport-id de-duplication on or off
    pub fn with_dedup(mut self, enabled: bool) -> Self {
        self.dedup = enabled.then(EventDeduplicator::default);
        self
    }

    /// Backoff for (re)subscribing; `max_retries` bounds consecutive failures
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decide whether `event` becomes a turn, and with which text
    pub fn admit(&mut self, event: &ChatEvent) -> Result<String, Skip> {
        if event.room_id != self.room_id {
            return Err(Skip::OtherRoom);
        }
        if event.sender == self.bot_user {
            return Err(Skip::OwnMessage);
        }
        if event.sender != self.authorized_sender {
            return Err(Skip::Unauthorized);
        }
        if let Some(dedup) = self.dedup.as_mut() {
            if !dedup.check_and_mark(&event.event_id) {
                return Err(Skip::Duplicate);
            }
        }
        // Quote blocks are only transport markup on real replies
        let text = if event.in_reply_to.is_some() {
            strip_reply_fallback(&event.body)
        } else {
            event.body.as_str()
        };
        if text.trim().is_empty() {
            return Err(Skip::Empty);
        }
        Ok(text.to_string())
    }

    async fn subscribe(
        &self,
        backoff: &mut BackoffState,
        cancel: &CancellationToken,
    ) -> Result<Option<EventStream>, BridgeError> {
        loop {
            match self.transport.subscribe(&self.room_id).await {
                Ok(stream) => {
                    tracing::info!(room_id = %self.room_id, "Subscribed to room");
                    return Ok(Some(stream));
                }
                Err(e) => {
                    tracing::warn!(
                        error = %format!("{:#}", e),
                        room_id = %self.room_id,
                        failures = backoff.consecutive_failures() + 1,
                        "Subscribe failed"
                    );
                    let Some(delay) = backoff.record_failure() else {
                        return Err(BridgeError::transport(
                            e.context(format!("Giving up subscribing to {}", self.room_id)),
                        ));
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Relay until `cancel` fires (Ok) or the subscription cannot be kept alive (Err)
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let mut backoff = BackoffState::new(self.backoff.clone());
        let mut turns = 0u64;

        'subscription: loop {
            let Some(mut stream) = self.subscribe(&mut backoff, &cancel).await? else {
                break;
            };

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break 'subscription,
                    event = stream.next() => event,
                };

                let Some(event) = event else {
                    tracing::warn!(room_id = %self.room_id, "Room subscription ended; resubscribing");
                    let Some(delay) = backoff.record_failure() else {
                        return Err(BridgeError::Transport(format!(
                            "Subscription to {} kept dropping",
                            self.room_id
                        )));
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break 'subscription,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue 'subscription;
                };
                backoff.record_success();

                let text = match self.admit(&event) {
                    Ok(text) => text,
                    Err(Skip::Unauthorized) => {
                        // Silent on purpose: no reply reveals that the bridge is listening
                        tracing::warn!(sender = %event.sender, "Ignoring message from unauthorized sender");
                        continue;
                    }
                    Err(reason) => {
                        tracing::debug!(event_id = %event.event_id, ?reason, "Inbound event skipped");
                        continue;
                    }
                };

                // Hand-off waits for the previous turn; draining abandons it
                let submitted = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(event_id = %event.event_id, "Draining; queued message not submitted");
                        break 'subscription;
                    }
                    result = self.agent.submit_turn(&text) => result,
                };

                match submitted {
                    Ok(()) => {
                        turns += 1;
                        tracing::info!(event_id = %event.event_id, chars = text.chars().count(), "Turn submitted");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Agent refused the turn");
                        let notice = self.formatter.format_error(
                            ErrorCode::BackendError,
                            &format!("Could not hand the message to the agent: {}", e),
                        );
                        if let Err(send_err) = self
                            .transport
                            .send(&self.room_id, MessageContent::plain(notice))
                            .await
                        {
                            tracing::warn!(error = %send_err, "Failed to report agent failure to room");
                        }
                        return Err(BridgeError::agent(e));
                    }
                }
            }
        }

        tracing::info!(room_id = %self.room_id, turns, "Inbound relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use roombridge_agent::backends::mock::MockBackend;

    const ROOM: &str = "!room:mock.local";

    fn relay() -> (Arc<MockTransport>, InboundRelay<MockTransport>) {
        let transport = Arc::new(MockTransport::new("@bot:mock.local"));
        let relay = InboundRelay::new(
            Arc::clone(&transport),
            MockBackend::new().into_handle(),
            ROOM,
            "@bot:mock.local",
            "@alice:mock.local",
        );
        (transport, relay)
    }

    #[tokio::test]
    async fn test_admit_filters() {
        let (t, mut relay) = relay();

        assert_eq!(
            relay.admit(&t.message("!other:mock.local", "@alice:mock.local", "hi")),
            Err(Skip::OtherRoom)
        );
        assert_eq!(
            relay.admit(&t.message(ROOM, "@bot:mock.local", "hi")),
            Err(Skip::OwnMessage)
        );
        assert_eq!(
            relay.admit(&t.message(ROOM, "@mallory:mock.local", "hi")),
            Err(Skip::Unauthorized)
        );
        assert_eq!(
            relay.admit(&t.message(ROOM, "@alice:mock.local", "  \n ")),
            Err(Skip::Empty)
        );

        let event = t.message(ROOM, "@alice:mock.local", "  keep  spacing ");
        assert_eq!(relay.admit(&event), Ok("  keep  spacing ".to_string()));
        assert_eq!(relay.admit(&event), Err(Skip::Duplicate));
    }

    #[tokio::test]
    async fn test_dedup_can_be_disabled() {
        let (t, relay) = relay();
        let mut relay = relay.with_dedup(false);
        let event = t.message(ROOM, "@alice:mock.local", "again");
        assert!(relay.admit(&event).is_ok());
        assert!(relay.admit(&event).is_ok());
    }

    #[tokio::test]
    async fn test_reply_fallback_stripped() {
        let (t, mut relay) = relay();
        let event = t.reply(
            ROOM,
            "@alice:mock.local",
            "> <@bot:mock.local> done\n\nnow run tests",
            "$earlier",
        );
        assert_eq!(relay.admit(&event), Ok("now run tests".to_string()));
    }

    #[tokio::test]
    async fn test_user_blockquote_is_kept() {
        let (t, mut relay) = relay();
        let body = "> The build says: error E0308\nwhy?";
        let event = t.message(ROOM, "@alice:mock.local", body);
        assert_eq!(relay.admit(&event), Ok(body.to_string()));

        let quote_only = t.message(ROOM, "@alice:mock.local", "> rewrite this line as a doc comment");
        assert_eq!(
            relay.admit(&quote_only),
            Ok("> rewrite this line as a doc comment".to_string())
        );
    }
}
