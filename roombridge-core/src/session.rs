// ABOUTME: Persistent directory -> agent session id map backed by SQLite.
// ABOUTME: Last write wins; a corrupted database is moved aside and recreated.
use crate::error::BridgeError;
use crate::workdir::WorkingDirectory;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long a writer waits on another process's lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub directory: String,
    pub session_id: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("Failed to open SQLite database")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // A save must survive a crash right after it returns
    conn.pragma_update(None, "synchronous", "FULL")?;
    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("Integrity check failed")?;
    if check != "ok" {
        anyhow::bail!("Integrity check reported: {}", check);
    }
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            directory TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Rename a broken database (and its journal) out of the way
fn quarantine(path: &Path) -> Result<PathBuf> {
    let aside = PathBuf::from(format!(
        "{}.corrupt-{}",
        path.display(),
        chrono::Utc::now().timestamp()
    ));
    std::fs::rename(path, &aside)
        .with_context(|| format!("Failed to move {} aside", path.display()))?;
    let journal = PathBuf::from(format!("{}-journal", path.display()));
    if journal.exists() {
        let _ = std::fs::remove_file(&journal);
    }
    Ok(aside)
}

impl SessionStore {
    /// Open `<state_dir>/sessions.db`, recreating it if it is unreadable
    pub fn open(state_dir: &Path) -> Result<Self, BridgeError> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {}", state_dir.display()))
            .map_err(BridgeError::persistence)?;
        let db_path = crate::paths::sessions_db(state_dir);

        let conn = match open_connection(&db_path) {
            Ok(conn) => conn,
            Err(e) if db_path.exists() => {
                let aside = quarantine(&db_path).map_err(BridgeError::persistence)?;
                tracing::warn!(
                    error = %format!("{:#}", e),
                    db = %db_path.display(),
                    moved_to = %aside.display(),
                    "Session database unreadable; starting with an empty one"
                );
                open_connection(&db_path).map_err(BridgeError::persistence)?
            }
            Err(e) => return Err(BridgeError::persistence(e)),
        };

        tracing::info!(db = %db_path.display(), "SessionStore initialized");
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: Some(db_path),
        })
    }

    /// Store that forgets everything on exit
    pub fn in_memory() -> Result<Self, BridgeError> {
        let conn = Connection::open_in_memory().map_err(BridgeError::persistence)?;
        init_schema(&conn).map_err(BridgeError::persistence)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    /// Full record for a directory
    pub fn record(&self, directory: &WorkingDirectory) -> Result<Option<SessionRecord>> {
        let db = self.conn()?;
        let record = db
            .query_row(
                "SELECT directory, session_id, updated_at FROM sessions WHERE directory = ?1",
                params![directory.as_key()],
                |row| {
                    Ok(SessionRecord {
                        directory: row.get(0)?,
                        session_id: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Latest session id for `directory`. Unreadable or blank records read as none.
    pub fn load(&self, directory: &WorkingDirectory) -> Option<String> {
        match self.record(directory) {
            Ok(record) => record
                .map(|r| r.session_id)
                .filter(|id| !id.trim().is_empty()),
            Err(e) => {
                tracing::warn!(
                    error = %format!("{:#}", e),
                    directory = %directory,
                    "Failed to read session record; starting fresh"
                );
                None
            }
        }
    }

    /// Overwrite the session id for `directory`. Durable once this returns.
    pub fn save(&self, directory: &WorkingDirectory, session_id: &str) -> Result<(), BridgeError> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.conn().map_err(BridgeError::persistence)?;
        db.execute(
            "INSERT INTO sessions (directory, session_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(directory) DO UPDATE SET session_id = excluded.session_id,
                                                  updated_at = excluded.updated_at",
            params![directory.as_key(), session_id, now],
        )
        .context("Failed to save session")
        .map_err(BridgeError::persistence)?;
        tracing::debug!(directory = %directory, %session_id, "Session id saved");
        Ok(())
    }

    pub fn clear(&self, directory: &WorkingDirectory) -> Result<(), BridgeError> {
        let db = self.conn().map_err(BridgeError::persistence)?;
        db.execute(
            "DELETE FROM sessions WHERE directory = ?1",
            params![directory.as_key()],
        )
        .context("Failed to clear session")
        .map_err(BridgeError::persistence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dir(tmp: &TempDir, name: &str) -> WorkingDirectory {
        let path = tmp.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        WorkingDirectory::new(path).unwrap()
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&tmp.path().join("state")).unwrap();
        let proj = dir(&tmp, "proj");

        assert_eq!(store.load(&proj), None);
        store.save(&proj, "S1").unwrap();
        assert_eq!(store.load(&proj).as_deref(), Some("S1"));
    }

    #[test]
    fn test_save_overwrites_never_merges() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        let proj = dir(&tmp, "proj");

        store.save(&proj, "S1").unwrap();
        store.save(&proj, "S2").unwrap();
        assert_eq!(store.load(&proj).as_deref(), Some("S2"));

        let db = store.conn().unwrap();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let proj = dir(&tmp, "proj");
        SessionStore::open(tmp.path()).unwrap().save(&proj, "S1").unwrap();
        let reopened = SessionStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.load(&proj).as_deref(), Some("S1"));
    }

    #[test]
    fn test_clear_removes_record() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        let proj = dir(&tmp, "proj");
        store.save(&proj, "S1").unwrap();
        store.clear(&proj).unwrap();
        assert_eq!(store.load(&proj), None);
    }

    #[test]
    fn test_corrupted_database_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join("state");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("sessions.db"), b"this is not a database at all, really").unwrap();

        let store = SessionStore::open(&state).unwrap();
        let proj = dir(&tmp, "proj");
        assert_eq!(store.load(&proj), None);
        store.save(&proj, "S9").unwrap();
        assert_eq!(store.load(&proj).as_deref(), Some("S9"));

        let moved_aside = std::fs::read_dir(&state)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("sessions.db.corrupt-"));
        assert!(moved_aside);
    }

    #[test]
    fn test_blank_session_id_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::in_memory().unwrap();
        let proj = dir(&tmp, "proj");
        store.save(&proj, "  ").unwrap();
        assert_eq!(store.load(&proj), None);
        assert!(!store.is_persistent());
    }
}
