// ABOUTME: In-memory ChatTransport for tests: records rooms, invites and sent messages.
// ABOUTME: Events are injected per room; failures and slow creation can be scripted.

use crate::traits::{ChatEvent, ChatTransport, ChatUser, EventStream, MessageContent, RoomSpec};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A message the mock transport was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub room_id: String,
    pub content: MessageContent,
}

pub struct MockTransport {
    user_id: String,
    rooms: Mutex<Vec<RoomSpec>>,
    invites: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<SentMessage>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ChatEvent>>>>,
    create_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    failing_creates: AtomicU32,
    failing_sends: AtomicU32,
    failing_subscribes: AtomicU32,
    fail_login: bool,
    fail_invites: bool,
    create_delay: Option<Duration>,
    send_delay: Mutex<Option<Duration>>,
    event_counter: AtomicU64,
    changed: Notify,
}

impl MockTransport {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            rooms: Mutex::new(Vec::new()),
            invites: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            create_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            failing_creates: AtomicU32::new(0),
            failing_sends: AtomicU32::new(0),
            failing_subscribes: AtomicU32::new(0),
            fail_login: false,
            fail_invites: false,
            create_delay: None,
            send_delay: Mutex::new(None),
            event_counter: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    /// Every create_room call sleeps this long first
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn with_failing_login(mut self) -> Self {
        self.fail_login = true;
        self
    }

    pub fn with_failing_invites(mut self) -> Self {
        self.fail_invites = true;
        self
    }

    /// The next `n` create_room calls fail
    pub fn fail_next_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// The next `n` send calls fail
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// The next `n` subscribe calls fail
    pub fn fail_next_subscribes(&self, n: u32) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Every send sleeps this long first
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *lock(&self.send_delay) = delay;
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn rooms(&self) -> Vec<RoomSpec> {
        lock(&self.rooms).clone()
    }

    pub fn invites(&self) -> Vec<(String, String)> {
        lock(&self.invites).clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    /// Plain-text bodies sent to `room_id`, in order
    pub fn sent_texts(&self, room_id: &str) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| m.content.text().to_string())
            .collect()
    }

    /// Build a message event with a fresh event id
    pub fn message(&self, room_id: &str, sender: &str, body: &str) -> ChatEvent {
        let n = self.event_counter.fetch_add(1, Ordering::SeqCst) + 1;
        ChatEvent {
            event_id: format!("$mock-event-{}", n),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
            formatted: None,
            in_reply_to: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Build a message event marked as a reply to `in_reply_to`
    pub fn reply(&self, room_id: &str, sender: &str, body: &str, in_reply_to: &str) -> ChatEvent {
        ChatEvent {
            in_reply_to: Some(in_reply_to.to_string()),
            ..self.message(room_id, sender, body)
        }
    }

    /// Deliver an event to every live subscription of its room.
    /// Returns how many subscriptions received it.
    pub fn inject(&self, event: ChatEvent) -> usize {
        let mut subscribers = lock(&self.subscribers);
        let Some(senders) = subscribers.get_mut(&event.room_id) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    /// End every subscription stream for `room_id`
    pub fn close_subscriptions(&self, room_id: &str) {
        lock(&self.subscribers).remove(room_id);
    }

    /// Wait until `room_id` has at least one live subscription
    pub async fn wait_for_subscriber(&self, room_id: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            lock(&self.subscribers)
                .get(room_id)
                .map(|subs| subs.iter().any(|tx| !tx.is_closed()))
                .unwrap_or(false)
        })
        .await
    }

    /// Wait until some message sent to `room_id` contains `needle`
    pub async fn wait_for_text(&self, room_id: &str, needle: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            self.sent_texts(room_id).iter().any(|t| t.contains(needle))
        })
        .await
    }

    async fn wait_until<F: Fn() -> bool>(&self, timeout: Duration, check: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if check() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return check();
            }
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ChatTransport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn login(&self) -> Result<ChatUser> {
        if self.fail_login {
            return Err(anyhow!("M_FORBIDDEN: invalid credentials"));
        }
        Ok(ChatUser::new(&self.user_id))
    }

    async fn create_room(&self, spec: &RoomSpec) -> Result<String> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_creates) {
            return Err(anyhow!("mock create_room failure"));
        }
        lock(&self.rooms).push(spec.clone());
        self.changed.notify_waiters();
        Ok(format!("!room{}:mock.local", n))
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        if self.fail_invites {
            return Err(anyhow!("mock invite failure"));
        }
        lock(&self.invites).push((room_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn subscribe(&self, room_id: &str) -> Result<EventStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_subscribes) {
            return Err(anyhow!("mock subscribe failure"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers)
            .entry(room_id.to_string())
            .or_default()
            .push(tx);
        self.changed.notify_waiters();
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(&self, room_id: &str, content: MessageContent) -> Result<()> {
        let delay = *lock(&self.send_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_sends) {
            return Err(anyhow!("mock send failure"));
        }
        lock(&self.sent).push(SentMessage {
            room_id: room_id.to_string(),
            content,
        });
        self.changed.notify_waiters();
        Ok(())
    }
}
