//! DuckDB-backed byte store.

use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;
use async_trait::async_trait;
use duckdb::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Per-connection resource caps. DuckDB otherwise claims most of the RAM and
/// every core, which a small on-device store never needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuckDbLimits {
    /// Value for `PRAGMA memory_limit`, e.g. `"64MB"`.
    pub memory_limit: String,
    pub threads: u32,
}

impl Default for DuckDbLimits {
    fn default() -> Self {
        Self {
            memory_limit: "64MB".to_string(),
            threads: 1,
        }
    }
}

/// Persists entries in a single `kv_entries` table.
#[derive(Clone)]
pub struct DuckDbKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbKvStore {
    /// Opens or creates a store at the given path with default limits.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_limits(path, &DuckDbLimits::default())
    }

    /// Opens or creates a store at the given path.
    ///
    /// A database left unopenable by a stale write-ahead log from an unclean
    /// shutdown is retried once with the log removed.
    pub fn open_with_limits(path: &Path, limits: &DuckDbLimits) -> StorageResult<Self> {
        let conn = connect(path)?;
        apply_limits(&conn, limits)?;
        initialize_kv_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_kv_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Io(format!("connection lock poisoned: {e}")))
    }
}

#[async_trait]
impl KvStore for DuckDbKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT value FROM kv_entries WHERE key = ?",
            params![key],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now_millis()],
        )?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv_entries WHERE key = ?", params![key])?;
        Ok(())
    }

    async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_entries ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    async fn multi_get(&self, keys: &[String]) -> StorageResult<Vec<(String, Option<String>)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM kv_entries WHERE key = ?")?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
                Ok(v) => Some(v),
                Err(duckdb::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            out.push((key.clone(), value));
        }
        Ok(out)
    }

    async fn multi_set(&self, entries: &[(String, String)]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_millis();
        for (key, value) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?)",
                params![key, value, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM kv_entries WHERE key = ?", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key FROM kv_entries WHERE starts_with(key, ?) ORDER BY key")?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

fn connect(path: &Path) -> StorageResult<Connection> {
    let first_err = match Connection::open(path) {
        Ok(conn) => return Ok(conn),
        Err(e) => e,
    };
    let wal = stale_wal_path(path);
    if !wal.exists() {
        return Err(first_err.into());
    }
    warn!(wal = %wal.display(), "open failed ({first_err}), removing stale WAL and retrying");
    if let Err(e) = std::fs::remove_file(&wal) {
        warn!(wal = %wal.display(), "could not remove stale WAL: {e}");
        return Err(first_err.into());
    }
    Ok(Connection::open(path)?)
}

/// `store.duckdb` → `store.duckdb.wal`; `store` → `store.wal`.
fn stale_wal_path(path: &Path) -> PathBuf {
    let extension = match path.extension() {
        Some(ext) => format!("{}.wal", ext.to_string_lossy()),
        None => "wal".to_string(),
    };
    path.with_extension(extension)
}

fn apply_limits(conn: &Connection, limits: &DuckDbLimits) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{}'; PRAGMA threads={};",
        limits.memory_limit, limits.threads
    ))?;
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn initialize_kv_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv_entries (
            key VARCHAR PRIMARY KEY,
            value VARCHAR NOT NULL,
            updated_at BIGINT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
