use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::CacheError;

pub const CACHE_KEY_LATEST: &str = "telemetry/latest";
pub const CACHE_KEY_HISTORY: &str = "telemetry/history";

pub const DEFAULT_CACHE_PATH: &str = "./telemetry_cache.db";

/// Durable key/value store for the last-known snapshot.
///
/// Each key is fully replaced on save, never merged.
pub trait SnapshotCache: Send + Sync {
    fn save(&self, key: &str, value: &Value) -> Result<(), CacheError>;

    /// `Ok(None)` when nothing was saved under `key`.
    fn load(&self, key: &str) -> Result<Option<Value>, CacheError>;
}

impl<T: SnapshotCache + ?Sized> SnapshotCache for Arc<T> {
    fn save(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        (**self).save(key, value)
    }

    fn load(&self, key: &str) -> Result<Option<Value>, CacheError> {
        (**self).load(key)
    }
}

impl<T: SnapshotCache + ?Sized> SnapshotCache for Box<T> {
    fn save(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        (**self).save(key, value)
    }

    fn load(&self, key: &str) -> Result<Option<Value>, CacheError> {
        (**self).load(key)
    }
}

/// SQLite-backed snapshot cache.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening snapshot cache at {}", path.display());
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                saved_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// When `key` was last written.
    pub fn saved_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        let saved_at = conn
            .query_row(
                "SELECT saved_at FROM snapshots WHERE key = ?1",
                params![key],
                |row| row.get::<_, DateTime<Utc>>(0),
            )
            .optional()?;
        Ok(saved_at)
    }
}

impl SnapshotCache for SqliteCache {
    fn save(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        let contents = serde_json::to_string(value)?;
        let conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        conn.execute(
            "INSERT INTO snapshots (key, value, saved_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, saved_at = excluded.saved_at",
            params![key, contents, Utc::now()],
        )?;
        debug!(key, bytes = contents.len(), "Saved snapshot");
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        let contents = conn
            .query_row(
                "SELECT value FROM snapshots WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        drop(conn);

        match contents {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

/// Process-local cache, for tests and for running without a writable disk.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotCache for MemoryCache {
    fn save(&self, key: &str, value: &Value) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable(format!("write to {} rejected", key)));
        }
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }
}
