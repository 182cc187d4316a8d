// ABOUTME: Matrix implementation of ChatTransport on top of matrix-sdk
// ABOUTME: Handles crypto-store client setup, login, room creation, invites, per-room subscriptions and sends

use anyhow::{Context, Result};
use async_trait::async_trait;
use matrix_sdk::{
    authentication::{matrix::MatrixSession, SessionTokens},
    config::SyncSettings,
    event_handler::EventHandlerHandle,
    room::Room,
    ruma::{
        api::client::room::{
            create_room::v3::{Request as CreateRoomRequest, RoomPreset},
            Visibility,
        },
        assign,
        events::{
            room::{
                encryption::RoomEncryptionEventContent,
                message::{MessageType, Relation, RoomMessageEventContent, SyncRoomMessageEvent},
            },
            InitialStateEvent,
        },
        OwnedRoomId, OwnedUserId,
    },
    AuthSession, Client, SessionMeta,
};
use roombridge_core::config::MatrixConfig;
use roombridge_core::paths;
use roombridge_core::traits::{
    ChatEvent, ChatTransport, ChatUser, EventStream, MessageContent, RoomSpec, RoomVisibility,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// Buffered events per subscription before the handler waits on the reader
const SUBSCRIPTION_BUFFER: usize = 256;

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<ChatEvent>>>>>;

pub struct MatrixTransport {
    config: MatrixConfig,
    store_dir: PathBuf,
    client: OnceLock<Client>,
    subscribers: Subscribers,
    /// Batch token from the initial sync; the sync loop continues from it
    next_batch: Mutex<Option<String>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    handler: Mutex<Option<EventHandlerHandle>>,
}

impl MatrixTransport {
    pub fn new(config: MatrixConfig, state_dir: &Path) -> Self {
        let store_dir = paths::crypto_store_dir(state_dir, &config.user_id, &config.device_name);
        Self {
            config,
            store_dir,
            client: OnceLock::new(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_batch: Mutex::new(None),
            sync_task: Mutex::new(None),
            handler: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .get()
            .context("Matrix client is not logged in")
    }

    fn room(&self, room_id: &str) -> Result<Room> {
        let room_id: OwnedRoomId = room_id.parse().context("Invalid room ID")?;
        self.client()?
            .get_room(&room_id)
            .with_context(|| format!("Room {} not found", room_id))
    }

    async fn create_client(&self) -> Result<Client> {
        // Ensure the crypto store directory exists
        std::fs::create_dir_all(&self.store_dir)
            .context("Failed to create crypto store directory")?;

        tracing::info!(path = %self.store_dir.display(), "Using crypto store directory");

        let client = Client::builder()
            .homeserver_url(&self.config.home_server)
            .sqlite_store(&self.store_dir, None)
            .build()
            .await
            .context("Failed to create Matrix client")?;

        tracing::info!("Matrix client created successfully");
        Ok(client)
    }

    async fn authenticate(&self, client: &Client) -> Result<()> {
        let access_token = self.config.access_token.as_deref().filter(|t| !t.is_empty());
        let password = self.config.password.as_deref().filter(|p| !p.is_empty());

        if let Some(token) = access_token {
            tracing::info!("Logging in with access token");
            let user_id: OwnedUserId = self.config.user_id.parse()?;
            let session = AuthSession::Matrix(MatrixSession {
                meta: SessionMeta {
                    user_id,
                    device_id: self.config.device_name.clone().into(),
                },
                tokens: SessionTokens {
                    access_token: token.to_string(),
                    refresh_token: None,
                },
            });
            client.restore_session(session).await?;
        } else if let Some(pwd) = password {
            tracing::info!("Logging in with password");
            client
                .matrix_auth()
                .login_username(&self.config.user_id, pwd)
                .device_id(&self.config.device_name)
                .send()
                .await
                .context("Failed to log in")?;
        } else {
            anyhow::bail!("Either MATRIX_PASSWORD or MATRIX_ACCESS_TOKEN is required");
        }
        Ok(())
    }

    /// Route room messages to whichever subscriptions exist for the room
    fn register_handler(&self, client: &Client, bot_user_id: String) -> EventHandlerHandle {
        let subscribers = Arc::clone(&self.subscribers);
        client.add_event_handler(move |event: SyncRoomMessageEvent, room: Room| {
            let subscribers = Arc::clone(&subscribers);
            let bot_user_id = bot_user_id.clone();
            async move {
                // Only process original events (not edits/redactions)
                let Some(original) = event.as_original() else {
                    return;
                };
                if original.sender.as_str() == bot_user_id {
                    return;
                }

                let (body, formatted) = match &original.content.msgtype {
                    MessageType::Text(text) => (
                        text.body.clone(),
                        text.formatted.as_ref().map(|f| f.body.clone()),
                    ),
                    MessageType::Notice(notice) => (
                        notice.body.clone(),
                        notice.formatted.as_ref().map(|f| f.body.clone()),
                    ),
                    MessageType::Emote(emote) => (
                        emote.body.clone(),
                        emote.formatted.as_ref().map(|f| f.body.clone()),
                    ),
                    _ => return,
                };

                let in_reply_to = match &original.content.relates_to {
                    Some(Relation::Reply { in_reply_to }) => Some(in_reply_to.event_id.to_string()),
                    _ => None,
                };

                let room_id = room.room_id().to_string();
                let senders: Vec<_> = {
                    let mut map = subscribers.lock().unwrap_or_else(|e| e.into_inner());
                    let Some(senders) = map.get_mut(&room_id) else {
                        return;
                    };
                    senders.retain(|tx| !tx.is_closed());
                    senders.clone()
                };

                let millis: u64 = original.origin_server_ts.0.into();
                let chat_event = ChatEvent {
                    event_id: original.event_id.to_string(),
                    room_id,
                    sender: original.sender.to_string(),
                    body,
                    formatted,
                    in_reply_to,
                    timestamp: millis as i64,
                };

                for tx in senders {
                    if tx.send(chat_event.clone()).await.is_err() {
                        tracing::debug!("Room subscription dropped");
                    }
                }
            }
        })
    }

    /// Start the long-running sync loop unless one is already running
    fn ensure_sync_loop(&self) -> Result<()> {
        let client = self.client()?.clone();
        let mut task = self.sync_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let mut settings = SyncSettings::default();
        if let Some(token) = self
            .next_batch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            settings = settings.token(token);
        }

        let subscribers = Arc::clone(&self.subscribers);
        tracing::info!("Starting continuous sync loop");
        *task = Some(tokio::spawn(async move {
            if let Err(e) = client.sync(settings).await {
                tracing::error!(error = %e, "Matrix sync loop stopped");
            }
            // Ending every stream lets subscribers notice and resubscribe
            subscribers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }));
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for MatrixTransport {
    fn name(&self) -> &'static str {
        "matrix"
    }

    async fn login(&self) -> Result<ChatUser> {
        let client = match self.client.get() {
            Some(client) => client.clone(),
            None => {
                let client = self.create_client().await?;
                self.authenticate(&client).await?;
                let _ = self.client.set(client.clone());
                client
            }
        };

        let user_id = client
            .user_id()
            .context("Login succeeded but user_id not available")?
            .to_string();
        tracing::info!(user_id = %user_id, "Logged in successfully");

        if let Some(name) = &self.config.display_name {
            if let Err(e) = client.account().set_display_name(Some(name.as_str())).await {
                tracing::warn!(error = %e, "Failed to set display name");
            }
        }

        // Initial sync uploads device keys and marks everything before now as seen
        tracing::info!("Performing initial sync...");
        let response = client
            .sync_once(SyncSettings::default())
            .await
            .context("Initial sync failed")?;
        *self.next_batch.lock().unwrap_or_else(|e| e.into_inner()) = Some(response.next_batch);
        tracing::info!("Initial sync complete");

        let mut handler = self.handler.lock().unwrap_or_else(|e| e.into_inner());
        if handler.is_none() {
            *handler = Some(self.register_handler(&client, user_id.clone()));
        }

        Ok(ChatUser {
            id: user_id,
            display_name: self.config.display_name.clone(),
        })
    }

    async fn create_room(&self, spec: &RoomSpec) -> Result<String> {
        let client = self.client()?;
        tracing::info!(room_name = %spec.name, encrypted = self.config.encrypted_rooms, "Creating room");

        let (visibility, preset) = match spec.visibility {
            RoomVisibility::Private => (Visibility::Private, RoomPreset::TrustedPrivateChat),
            RoomVisibility::Public => (Visibility::Public, RoomPreset::PublicChat),
        };
        let initial_state = if self.config.encrypted_rooms {
            vec![InitialStateEvent::with_empty_state_key(
                RoomEncryptionEventContent::with_recommended_defaults(),
            )
            .to_raw_any()]
        } else {
            Vec::new()
        };

        let request = assign!(CreateRoomRequest::new(), {
            name: Some(spec.name.clone()),
            topic: Some(spec.topic.clone()),
            visibility: visibility,
            preset: Some(preset),
            initial_state: initial_state,
        });

        let room = client
            .create_room(request)
            .await
            .context("Failed to create room")?;

        let room_id = room.room_id().to_string();
        tracing::info!(%room_id, "Room created successfully");
        Ok(room_id)
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        tracing::info!(%room_id, user_id, "Inviting user to room");
        let user_id_parsed: OwnedUserId = user_id.parse().context("Invalid user ID")?;
        self.room(room_id)?
            .invite_user_by_id(&user_id_parsed)
            .await
            .context("Failed to invite user")?;
        Ok(())
    }

    async fn subscribe(&self, room_id: &str) -> Result<EventStream> {
        let _: OwnedRoomId = room_id.parse().context("Invalid room ID")?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(room_id.to_string())
            .or_default()
            .push(tx);
        self.ensure_sync_loop()?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(&self, room_id: &str, content: MessageContent) -> Result<()> {
        let msg_content = match content {
            MessageContent::Plain(text) => RoomMessageEventContent::text_plain(text),
            MessageContent::Html { plain, html } => RoomMessageEventContent::text_html(plain, html),
        };
        self.room(room_id)?
            .send(msg_content)
            .await
            .context("Failed to send message")?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.sync_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        if let Some(handler) = self.handler.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if let Ok(client) = self.client() {
                client.remove_event_handler(handler);
            }
        }
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::info!("Matrix transport stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MatrixConfig {
        MatrixConfig {
            home_server: "https://matrix.example.org".to_string(),
            user_id: "@bot:example.org".to_string(),
            password: Some("secret".to_string()),
            admin_user: "@alice:example.org".to_string(),
            ..MatrixConfig::default()
        }
    }

    #[test]
    fn test_matrix_transport_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MatrixTransport>();
    }

    #[test]
    fn test_crypto_store_is_per_user_and_device() {
        let transport = MatrixTransport::new(config(), Path::new("/state"));
        assert_eq!(
            transport.store_dir,
            PathBuf::from("/state/crypto_store/_bot_example_org_roombridge")
        );
    }

    #[tokio::test]
    async fn test_operations_before_login_fail() {
        let transport = MatrixTransport::new(config(), Path::new("/state"));
        assert!(transport.send("!room:example.org", MessageContent::plain("hi")).await.is_err());
        assert!(transport.invite("!room:example.org", "@alice:example.org").await.is_err());
        assert!(transport.subscribe("not a room").await.is_err());
    }
}
