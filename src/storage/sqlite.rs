use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use directories::ProjectDirs;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::bridge::PersistedEntry;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("unable to determine data directory")]
    DataDir,
}

/// Host-side persistence of content storage, one namespace per content id.
///
/// Entries keep the position at which their key was first inserted so the
/// handshake can replay them in the order content observes through `key(i)`.
pub struct HostStore {
    pool: Pool<SqliteConnectionManager>,
}

#[derive(Debug)]
struct SqliteCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(1))
    }
}

impl HostStore {
    pub fn new() -> Result<Self, StorageError> {
        Self::open(&database_path()?)
    }

    /// Create a store inside `dir` instead of the data directory `new` resolves
    /// from `SANDBOX_DATA_DIR` or the platform defaults.
    pub fn new_with_path(dir: &Path) -> Result<Self, StorageError> {
        Self::open(&dir.join("storage.sqlite3"))
    }

    fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| StorageError::DataDir)?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)?;

        let conn = pool.get()?;
        initialise_schema(&conn)?;
        tracing::debug!(target: "sandbox::storage", path = %path.display(), "host store ready");

        Ok(Self { pool })
    }

    pub fn set(&self, content_id: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO storage_entries (content_id, key, value, position, updated_at)
            VALUES (
                ?1, ?2, ?3,
                (SELECT COALESCE(MAX(position) + 1, 0) FROM storage_entries WHERE content_id = ?1),
                ?4
            )
            ON CONFLICT (content_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![content_id, key, value, unix_timestamp()],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn remove(&self, content_id: &str, key: &str) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM storage_entries WHERE content_id = ?1 AND key = ?2",
            params![content_id, key],
        )?;
        Ok(removed > 0)
    }

    pub fn clear(&self, content_id: &str) -> Result<usize, StorageError> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM storage_entries WHERE content_id = ?1",
            params![content_id],
        )?;
        Ok(removed)
    }

    /// Entries of `content_id` in first-insertion order.
    pub fn snapshot(&self, content_id: &str) -> Result<Vec<PersistedEntry>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM storage_entries WHERE content_id = ?1 ORDER BY position",
        )?;
        let mut rows = stmt.query([content_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(PersistedEntry {
                key: row.get(0)?,
                value: row.get(1)?,
            });
        }
        Ok(entries)
    }
}

fn database_path() -> Result<PathBuf, StorageError> {
    if let Ok(dir) = std::env::var("SANDBOX_DATA_DIR") {
        let mut path = PathBuf::from(dir);
        path.push("storage.sqlite3");
        return Ok(path);
    }

    if let Some(dirs) = ProjectDirs::from("org", "SandboxBridge", "SandboxBridge") {
        let mut data_dir = dirs.data_dir().to_path_buf();
        data_dir.push("storage.sqlite3");
        Ok(data_dir)
    } else {
        Err(StorageError::DataDir)
    }
}

fn initialise_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        CREATE TABLE IF NOT EXISTS storage_entries (
            content_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            position INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (content_id, key)
        );
        "#,
    )?;
    Ok(())
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, value: &str) -> PersistedEntry {
        PersistedEntry {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn overwrite_keeps_first_insertion_position() {
        let dir = TempDir::new().unwrap();
        let store = HostStore::new_with_path(dir.path()).unwrap();
        store.set("lesson-1", "a", "1").unwrap();
        store.set("lesson-1", "b", "2").unwrap();
        store.set("lesson-1", "a", "3").unwrap();

        assert_eq!(
            store.snapshot("lesson-1").unwrap(),
            vec![entry("a", "3"), entry("b", "2")]
        );
    }

    #[test]
    fn content_ids_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = HostStore::new_with_path(dir.path()).unwrap();
        store.set("lesson-1", "score", "10").unwrap();
        store.set("lesson-2", "score", "99").unwrap();

        assert_eq!(store.clear("lesson-2").unwrap(), 1);
        assert_eq!(store.snapshot("lesson-1").unwrap(), vec![entry("score", "10")]);
        assert!(store.snapshot("lesson-2").unwrap().is_empty());
    }

    #[test]
    fn remove_reports_missing_keys() {
        let dir = TempDir::new().unwrap();
        let store = HostStore::new_with_path(dir.path()).unwrap();
        store.set("lesson-1", "a", "1").unwrap();
        assert!(store.remove("lesson-1", "a").unwrap());
        assert!(!store.remove("lesson-1", "a").unwrap());
    }
}
