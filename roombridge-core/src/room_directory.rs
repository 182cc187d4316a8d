// ABOUTME: Persistent directory -> room mapping that creates rooms lazily and exactly once.
// ABOUTME: Creation is serialized in-process by a per-directory lock and across processes by a SQLite lease.
use crate::backoff::{BackoffConfig, BackoffState};
use crate::error::BridgeError;
use crate::traits::{ChatTransport, RoomSpec, RoomVisibility};
use crate::workdir::WorkingDirectory;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LEASE: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub directory: String,
    pub room_id: String,
    pub created_at: String,
}

/// Outcome of trying to take the creation lease for a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// We may create the room
    Acquired,
    /// Another resolver is creating it right now
    Held { owner: String },
    /// The room already exists
    Exists(String),
}

/// SQLite-backed room map shared by every bridge process on the machine
#[derive(Clone)]
pub struct RoomStore {
    db: Arc<Mutex<Connection>>,
}

impl RoomStore {
    /// Open `<state_dir>/rooms.db`
    pub fn open(state_dir: &Path) -> Result<Self, BridgeError> {
        Self::open_inner(state_dir).map_err(BridgeError::persistence)
    }

    fn open_inner(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;
        let db_path = crate::paths::rooms_db(state_dir);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rooms (
                directory TEXT PRIMARY KEY,
                room_id TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS room_claims (
                directory TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                claimed_at INTEGER NOT NULL
            )",
            [],
        )?;

        tracing::info!(db = %db_path.display(), "RoomStore initialized");
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    pub fn lookup(&self, directory: &str) -> Result<Option<RoomRecord>> {
        let db = self.conn()?;
        let record = db
            .query_row(
                "SELECT directory, room_id, created_at FROM rooms WHERE directory = ?1",
                params![directory],
                |row| {
                    Ok(RoomRecord {
                        directory: row.get(0)?,
                        room_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Compare-and-swap on the claim row: succeeds only if no room exists and
    /// nobody else holds an unexpired claim.
    pub fn try_claim(&self, directory: &str, owner: &str, lease: Duration) -> Result<Claim> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT room_id FROM rooms WHERE directory = ?1",
                params![directory],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(room_id) = existing {
            tx.commit()?;
            return Ok(Claim::Exists(room_id));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let holder: Option<(String, i64)> = tx
            .query_row(
                "SELECT owner, claimed_at FROM room_claims WHERE directory = ?1",
                params![directory],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((holder, claimed_at)) = holder {
            let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
            if holder != owner && now.saturating_sub(claimed_at) < lease_ms {
                tx.commit()?;
                return Ok(Claim::Held { owner: holder });
            }
            if holder != owner {
                tracing::warn!(%directory, stale_owner = %holder, "Taking over expired room claim");
            }
        }

        tx.execute(
            "INSERT INTO room_claims (directory, owner, claimed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(directory) DO UPDATE SET owner = excluded.owner,
                                                  claimed_at = excluded.claimed_at",
            params![directory, owner, now],
        )?;
        tx.commit()?;
        Ok(Claim::Acquired)
    }

    /// Record a created room and drop the claim in one transaction
    pub fn insert_room(&self, directory: &str, room_id: &str) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO rooms (directory, room_id, created_at) VALUES (?1, ?2, ?3)",
            params![directory, room_id, chrono::Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to record room {} for {}", room_id, directory))?;
        tx.execute(
            "DELETE FROM room_claims WHERE directory = ?1",
            params![directory],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop our claim after a failed creation so others can try
    pub fn release_claim(&self, directory: &str, owner: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "DELETE FROM room_claims WHERE directory = ?1 AND owner = ?2",
            params![directory, owner],
        )?;
        Ok(())
    }
}

/// Resolves working directories to rooms, creating each room at most once
pub struct RoomDirectory<T: ChatTransport> {
    transport: Arc<T>,
    store: RoomStore,
    admin_user: String,
    room_prefix: String,
    create_attempts: u32,
    backoff: BackoffConfig,
    lease: Duration,
    poll_interval: Duration,
    owner: String,
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: ChatTransport> RoomDirectory<T> {
    pub fn new(transport: Arc<T>, store: RoomStore, admin_user: impl Into<String>) -> Self {
        Self {
            transport,
            store,
            admin_user: admin_user.into(),
            room_prefix: "Agent".to_string(),
            create_attempts: 1,
            backoff: BackoffConfig::default(),
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            owner: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
            locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_room_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.room_prefix = prefix.into();
        self
    }

    /// Bounded attempts; retrying a create that may have succeeded risks a duplicate room
    pub fn with_create_attempts(mut self, attempts: u32, backoff: BackoffConfig) -> Self {
        self.create_attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn with_lease(mut self, lease: Duration, poll_interval: Duration) -> Self {
        self.lease = lease;
        self.poll_interval = poll_interval;
        self
    }

    /// Name and topic for the room of `directory`
    pub fn room_spec(&self, directory: &WorkingDirectory) -> RoomSpec {
        RoomSpec {
            name: format!("{} [{}]", self.room_prefix, directory.display_name()),
            topic: format!("Coding agent for {}", directory),
            visibility: RoomVisibility::Private,
        }
    }

    async fn directory_lock(&self, directory: &WorkingDirectory) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(directory.as_key().to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Room for `directory`, created and persisted on first use
    pub async fn resolve(&self, directory: &WorkingDirectory) -> Result<String, BridgeError> {
        let lock = self.directory_lock(directory).await;
        let _guard = lock.lock().await;
        let key = directory.as_key();

        loop {
            if let Some(record) = self.store.lookup(key).map_err(BridgeError::persistence)? {
                tracing::debug!(%directory, room_id = %record.room_id, "Room found");
                return Ok(record.room_id);
            }

            match self
                .store
                .try_claim(key, &self.owner, self.lease)
                .map_err(BridgeError::persistence)?
            {
                Claim::Exists(room_id) => return Ok(room_id),
                Claim::Acquired => break,
                Claim::Held { owner } => {
                    tracing::info!(%directory, %owner, "Another bridge is creating this room; waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        let result = self.create_claimed(directory).await;
        if result.is_err() {
            if let Err(e) = self.store.release_claim(key, &self.owner) {
                tracing::warn!(error = %e, %directory, "Failed to release room claim");
            }
        }
        result
    }

    async fn create_claimed(&self, directory: &WorkingDirectory) -> Result<String, BridgeError> {
        let spec = self.room_spec(directory);
        let mut backoff = BackoffState::new(self.backoff.clone());
        let mut attempt = 0;

        let room_id = loop {
            attempt += 1;
            match self.transport.create_room(&spec).await {
                Ok(room_id) => break room_id,
                Err(e) => {
                    tracing::warn!(
                        error = %format!("{:#}", e),
                        %directory,
                        attempt,
                        max_attempts = self.create_attempts,
                        "Room creation failed"
                    );
                    if attempt >= self.create_attempts {
                        return Err(BridgeError::transport(
                            e.context(format!("Failed to create room for {}", directory)),
                        ));
                    }
                    if let Some(delay) = backoff.record_failure() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        self.store
            .insert_room(directory.as_key(), &room_id)
            .map_err(BridgeError::persistence)?;
        tracing::info!(%directory, %room_id, name = %spec.name, "Room created");

        if let Err(e) = self.transport.invite(&room_id, &self.admin_user).await {
            tracing::warn!(
                error = %format!("{:#}", e),
                %room_id,
                admin = %self.admin_user,
                "Failed to invite admin; they can join the room manually"
            );
        }

        Ok(room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_is_exclusive_until_lease_expires() {
        let tmp = TempDir::new().unwrap();
        let store = RoomStore::open(tmp.path()).unwrap();

        assert_eq!(
            store.try_claim("/p", "a", Duration::from_secs(60)).unwrap(),
            Claim::Acquired
        );
        assert_eq!(
            store.try_claim("/p", "b", Duration::from_secs(60)).unwrap(),
            Claim::Held {
                owner: "a".to_string()
            }
        );
        // Zero lease: a's claim counts as expired
        assert_eq!(
            store.try_claim("/p", "b", Duration::ZERO).unwrap(),
            Claim::Acquired
        );
    }

    #[test]
    fn test_insert_room_clears_claim_and_is_append_only() {
        let tmp = TempDir::new().unwrap();
        let store = RoomStore::open(tmp.path()).unwrap();
        store.try_claim("/p", "a", DEFAULT_LEASE).unwrap();
        store.insert_room("/p", "!r1:example.org").unwrap();

        assert_eq!(
            store.try_claim("/p", "b", DEFAULT_LEASE).unwrap(),
            Claim::Exists("!r1:example.org".to_string())
        );
        assert!(store.insert_room("/p", "!r2:example.org").is_err());
        assert_eq!(store.lookup("/p").unwrap().unwrap().room_id, "!r1:example.org");
    }

    #[test]
    fn test_release_only_drops_own_claim() {
        let tmp = TempDir::new().unwrap();
        let store = RoomStore::open(tmp.path()).unwrap();
        store.try_claim("/p", "a", DEFAULT_LEASE).unwrap();
        store.release_claim("/p", "b").unwrap();
        assert!(matches!(
            store.try_claim("/p", "b", DEFAULT_LEASE).unwrap(),
            Claim::Held { .. }
        ));
        store.release_claim("/p", "a").unwrap();
        assert_eq!(
            store.try_claim("/p", "b", DEFAULT_LEASE).unwrap(),
            Claim::Acquired
        );
    }
}
