use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use fairq_core::config::DatabaseConfig;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::{error::CollaboratorError, store::KvStore};

/// Initialise the key/value schema in `conn`.
///
/// Creates the `kv_entries` table (idempotent) and an index on `expires_at`
/// so expiry pruning stays cheap as the table grows.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_entries (
            key         TEXT    NOT NULL PRIMARY KEY,
            value       TEXT    NOT NULL,   -- JSON-encoded job config
            expires_at  INTEGER NOT NULL    -- unix seconds
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_kv_entries_expires_at ON kv_entries (expires_at);
        ",
    )?;
    Ok(())
}

/// SQLite-backed [`KvStore`]. Survives restarts, which is what
/// `SchedulerEngine::restore` relies on.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self, CollaboratorError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self, CollaboratorError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Open the database named by `[database] path`, creating its directory.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, CollaboratorError> {
        if let Some(parent) = Path::new(&config.path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CollaboratorError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        Self::open(&config.path)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CollaboratorError> {
        self.conn
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("sqlite connection poisoned".to_string()))
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CollaboratorError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1 AND expires_at > ?2",
                rusqlite::params![key, Utc::now().timestamp()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CollaboratorError> {
        let conn = self.lock()?;
        let now = Utc::now().timestamp();
        let expires_at = now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));

        let pruned = conn.execute("DELETE FROM kv_entries WHERE expires_at <= ?1", [now])?;
        if pruned > 0 {
            debug!(count = pruned, "pruned expired kv entries");
        }
        conn.execute(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            rusqlite::params![key, value, expires_at],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CollaboratorError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM kv_entries WHERE key = ?1 AND expires_at > ?2",
            rusqlite::params![key, Utc::now().timestamp()],
        )?;
        Ok(n > 0)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CollaboratorError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key FROM kv_entries
             WHERE substr(key, 1, length(?1)) = ?1 AND expires_at > ?2
             ORDER BY key",
        )?;
        let keys = stmt
            .query_map(rusqlite::params![prefix, Utc::now().timestamp()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn upsert_overwrites_value() {
        let store = store();
        store.set("scheduled_job:1", "a", 60).await.unwrap();
        store.set("scheduled_job:1", "b", 60).await.unwrap();
        assert_eq!(store.get("scheduled_job:1").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn expired_rows_are_invisible() {
        let store = store();
        store.set("gone", "x", 0).await.unwrap();
        assert!(store.get("gone").await.unwrap().is_none());
        assert!(!store.delete("gone").await.unwrap());
    }

    #[tokio::test]
    async fn list_keys_uses_literal_prefix() {
        let store = store();
        store.set("scheduled_job:1", "x", 60).await.unwrap();
        store.set("scheduled_job:2", "x", 60).await.unwrap();
        // `_` is a LIKE wildcard; the prefix match must not treat it as one.
        store.set("scheduledXjob:3", "x", 60).await.unwrap();
        let keys = store.list_keys("scheduled_job:").await.unwrap();
        assert_eq!(keys, vec!["scheduled_job:1", "scheduled_job:2"]);
    }

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }
}
