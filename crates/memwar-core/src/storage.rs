//! Durable key-value storage behind the contact store.
//!
//! Every record lives under a scope (the current user) and a key. A key
//! holds either a single value (`Put`) or an append-only log (`Append`).
//! A `commit` applies all of its writes or none of them.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create storage directory: {0}")]
    CreateDir(std::io::Error),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// A single write inside a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Write<'a> {
    /// Replace the value stored under `key`.
    Put { key: &'a str, value: String },
    /// Add `value` to the end of the log stored under `key`.
    Append { key: &'a str, value: String },
}

pub trait Storage: Send {
    /// Read the value stored under `key`, or `None` if it was never written.
    fn read(&self, scope: &str, key: &str) -> Result<Option<String>, StorageError>;

    /// Read every entry of the log under `key`, oldest first.
    fn read_log(&self, scope: &str, key: &str) -> Result<Vec<String>, StorageError>;

    /// Apply all writes atomically.
    fn commit(&mut self, scope: &str, writes: &[Write<'_>]) -> Result<(), StorageError>;
}

/// SQLite-backed storage. One transaction per commit.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StorageError::CreateDir)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::info!(path = %path.display(), journal = %mode, "opened contact database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                scope TEXT NOT NULL,
                key   TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (scope, key)
            );
            CREATE TABLE IF NOT EXISTS logs (
                seq   INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                key   TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_scope_key ON logs(scope, key, seq);
            "#,
        )?;
        Ok(Self { conn })
    }
}

impl Storage for SqliteStorage {
    fn read(&self, scope: &str, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM records WHERE scope = ?1 AND key = ?2",
                params![scope, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn read_log(&self, scope: &str, key: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM logs WHERE scope = ?1 AND key = ?2 ORDER BY seq")?;
        let rows = stmt.query_map(params![scope, key], |row| row.get(0))?;
        let entries = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(entries)
    }

    fn commit(&mut self, scope: &str, writes: &[Write<'_>]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for write in writes {
            match write {
                Write::Put { key, value } => {
                    tx.execute(
                        "INSERT INTO records (scope, key, value) VALUES (?1, ?2, ?3)
                         ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value",
                        params![scope, key, value],
                    )?;
                }
                Write::Append { key, value } => {
                    tx.execute(
                        "INSERT INTO logs (scope, key, value) VALUES (?1, ?2, ?3)",
                        params![scope, key, value],
                    )?;
                }
            }
        }
        tx.commit()?;
        tracing::debug!(scope, writes = writes.len(), "storage commit");
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<(String, String), String>,
    logs: HashMap<(String, String), Vec<String>>,
    fail_commits: bool,
}

/// In-process storage. Clones share the same state, so a second store can
/// be opened over the data a first one wrote.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail without touching stored data.
    pub fn set_fail_commits(&self, fail: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_commits = fail;
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".into()))
    }
}

impl Storage for MemoryStorage {
    fn read(&self, scope: &str, key: &str) -> Result<Option<String>, StorageError> {
        let state = self.state()?;
        Ok(state.records.get(&(scope.to_string(), key.to_string())).cloned())
    }

    fn read_log(&self, scope: &str, key: &str) -> Result<Vec<String>, StorageError> {
        let state = self.state()?;
        Ok(state
            .logs
            .get(&(scope.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn commit(&mut self, scope: &str, writes: &[Write<'_>]) -> Result<(), StorageError> {
        let mut state = self.state()?;
        if state.fail_commits {
            return Err(StorageError::Unavailable("commit rejected".into()));
        }
        for write in writes {
            match write {
                Write::Put { key, value } => {
                    state
                        .records
                        .insert((scope.to_string(), key.to_string()), value.clone());
                }
                Write::Append { key, value } => {
                    state
                        .logs
                        .entry((scope.to_string(), key.to_string()))
                        .or_default()
                        .push(value.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &mut dyn Storage) {
        assert_eq!(storage.read("alice", "roster").unwrap(), None);
        assert!(storage.read_log("alice", "log").unwrap().is_empty());

        storage
            .commit(
                "alice",
                &[
                    Write::Put { key: "roster", value: "[1]".into() },
                    Write::Append { key: "log", value: "a".into() },
                ],
            )
            .unwrap();
        storage
            .commit(
                "alice",
                &[
                    Write::Put { key: "roster", value: "[1,2]".into() },
                    Write::Append { key: "log", value: "b".into() },
                ],
            )
            .unwrap();

        assert_eq!(storage.read("alice", "roster").unwrap().as_deref(), Some("[1,2]"));
        assert_eq!(storage.read_log("alice", "log").unwrap(), vec!["a", "b"]);
        // Scopes are isolated
        assert_eq!(storage.read("bob", "roster").unwrap(), None);
        assert!(storage.read_log("bob", "log").unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_put_and_append() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        exercise(&mut storage);
    }

    #[test]
    fn test_memory_put_and_append() {
        let mut storage = MemoryStorage::new();
        exercise(&mut storage);
    }

    #[test]
    fn test_memory_clones_share_state() {
        let mut a = MemoryStorage::new();
        let b = a.clone();
        a.commit("u", &[Write::Put { key: "k", value: "v".into() }]).unwrap();
        assert_eq!(b.read("u", "k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_memory_failed_commit_leaves_state() {
        let mut storage = MemoryStorage::new();
        storage.commit("u", &[Write::Put { key: "k", value: "old".into() }]).unwrap();
        storage.set_fail_commits(true);
        assert!(storage
            .commit("u", &[Write::Put { key: "k", value: "new".into() }])
            .is_err());
        assert_eq!(storage.read("u", "k").unwrap().as_deref(), Some("old"));
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/memwar.db");
        {
            let mut storage = SqliteStorage::open(&path).unwrap();
            storage
                .commit("u", &[Write::Append { key: "log", value: "first".into() }])
                .unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.read_log("u", "log").unwrap(), vec!["first"]);
    }
}
