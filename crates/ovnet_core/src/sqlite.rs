use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::PathBuf;
use tracing::info;

use crate::config::OverlayConfig;
use crate::store::{KvPair, KvStore, StoreError};

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// A [`KvStore`] persisted in a single SQLite file.
///
/// Indices come from a counter row in `kv_meta` so they stay monotonic
/// across deletes and restarts.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the store at the given path.
    pub fn open_at(path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Local store opened at {}", path.display());
        Ok(store)
    }

    /// Opens the local store named by `config`, creating its directory.
    pub fn open_configured(config: &OverlayConfig) -> Result<Self> {
        let path = config.store_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        Self::open_at(path)
    }

    /// Opens an in-memory store (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                idx INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv_meta (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                last_index INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO kv_meta (id, last_index) VALUES (0, 0);
            ",
        )?;
        Ok(())
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<KvPair, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value, idx FROM kv WHERE key = ?1",
            params![key],
            |row| {
                Ok(KvPair {
                    key: key.to_string(),
                    value: row.get(0)?,
                    index: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .optional()
        .map_err(backend)?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put_atomic(
        &self,
        key: &str,
        value: Vec<u8>,
        previous: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        let current: Option<i64> = tx
            .query_row("SELECT idx FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(backend)?;
        if current.map(|i| i as u64) != previous {
            return Err(StoreError::Conflict(key.to_string()));
        }

        tx.execute("UPDATE kv_meta SET last_index = last_index + 1 WHERE id = 0", [])
            .map_err(backend)?;
        let index: i64 = tx
            .query_row("SELECT last_index FROM kv_meta WHERE id = 0", [], |row| {
                row.get(0)
            })
            .map_err(backend)?;
        tx.execute(
            "INSERT INTO kv (key, value, idx) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, idx = excluded.idx",
            params![key, value, index],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(index as u64)
    }

    fn delete_atomic(&self, key: &str, previous: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        let current: Option<i64> = tx
            .query_row("SELECT idx FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(backend)?;
        match current {
            None => return Err(StoreError::NotFound(key.to_string())),
            Some(idx) if idx as u64 != previous => {
                return Err(StoreError::Conflict(key.to_string()));
            }
            Some(_) => {}
        }

        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key, value, idx FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok(KvPair {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    index: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(backend)?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row.map_err(backend)?);
        }
        Ok(pairs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
