//! SQLite storage backend.
//!
//! ## Design
//! - r2d2 pool of WAL-mode connections so readers run in parallel
//! - Writers serialise on SQLite's page lock; every multi-statement write
//!   takes an IMMEDIATE transaction so the write lock is acquired up front
//! - `busy_timeout` and the pool checkout timeout share the configured
//!   bound; hitting either surfaces [`FmdError::Timeout`]
//! - Single-row invariants are unique indexes, not application logic

mod commands;
mod devices;
mod nonces;
mod positions;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};

use crate::config::StorageConfig;
use crate::error::{FmdError, FmdResult};
use crate::observability::Metrics;

use super::Storage;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS device (
        device_id     TEXT PRIMARY KEY,
        lockable      INTEGER NOT NULL DEFAULT 0,
        logged_in     INTEGER NOT NULL DEFAULT 0,
        last_exchange INTEGER NOT NULL,
        hawk_secret   TEXT NOT NULL DEFAULT '',
        push_url      TEXT NOT NULL DEFAULT '',
        accepts       TEXT NOT NULL DEFAULT '',
        access_token  TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS user_device_map (
        user_id   TEXT NOT NULL,
        device_id TEXT NOT NULL,
        name      TEXT,
        date      INTEGER NOT NULL,
        PRIMARY KEY (user_id, device_id)
    );
    CREATE INDEX IF NOT EXISTS idx_user_device_map_device ON user_device_map(device_id);

    CREATE TABLE IF NOT EXISTS pending_command (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        time      INTEGER NOT NULL,
        cmd       TEXT NOT NULL,
        type      TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_command_key ON pending_command(device_id, type);

    CREATE TABLE IF NOT EXISTS position (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        time      INTEGER NOT NULL,
        latitude  REAL NOT NULL,
        longitude REAL NOT NULL,
        altitude  REAL NOT NULL DEFAULT 0,
        accuracy  REAL NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_position_device ON position(device_id);
    CREATE INDEX IF NOT EXISTS idx_position_time ON position(time);

    CREATE TABLE IF NOT EXISTS nonce (
        key  TEXT PRIMARY KEY,
        val  TEXT NOT NULL,
        time INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_nonce_time ON nonce(time);
";

/// SQLite-backed [`Storage`].
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    metrics: Arc<dyn Metrics>,
    max_devices: u32,
    position_expiry: Duration,
}

/// Registry constructor.
pub(crate) fn open_backend(
    config: &StorageConfig,
    metrics: Arc<dyn Metrics>,
) -> FmdResult<Arc<dyn Storage>> {
    let path = config.expanded_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| FmdError::Config {
            message: format!("Failed to create database dir {}: {e}", parent.display()),
        })?;
    }
    Ok(Arc::new(SqliteStore::open(&path, config, metrics)?))
}

impl SqliteStore {
    /// Open (or create) the database file at `db_path`.
    ///
    /// Does not touch the schema; call [`Storage::init`].
    pub fn open(db_path: &Path, config: &StorageConfig, metrics: Arc<dyn Metrics>) -> FmdResult<Self> {
        let busy_timeout = config.timeout();
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )
        });
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.timeout())
            .build(manager)
            .map_err(|e| FmdError::Storage {
                operation: "open",
                key: db_path.display().to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            pool,
            metrics,
            max_devices: config.max_devices_per_user,
            position_expiry: Duration::from_secs(config.position_expiry_secs),
        })
    }

    /// Check out a pooled connection within the configured timeout.
    pub(crate) fn conn(
        &self,
        operation: &'static str,
        key: &str,
    ) -> FmdResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            tracing::error!(operation, key, error = %e, "Storage connection unavailable");
            FmdError::Timeout {
                operation,
                key: key.to_string(),
            }
        })
    }
}

/// Log and classify a driver error. Busy/locked means the wait bound was hit.
pub(crate) fn storage_error(operation: &'static str, key: &str, err: rusqlite::Error) -> FmdError {
    let busy = matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );
    if busy {
        tracing::warn!(operation, key, error = %err, "Storage operation timed out");
        FmdError::Timeout {
            operation,
            key: key.to_string(),
        }
    } else {
        tracing::error!(operation, key, error = %err, "Storage operation failed");
        FmdError::Storage {
            operation,
            key: key.to_string(),
            source: Box::new(err),
        }
    }
}

impl Storage for SqliteStore {
    fn create_schema(&self) -> FmdResult<()> {
        let conn = self.conn("create_schema", "")?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| storage_error("create_schema", "", e))
    }

    fn get_meta(&self, key: &str) -> FmdResult<Option<String>> {
        let conn = self.conn("get_meta", key)?;
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| storage_error("get_meta", key, e))
    }

    fn set_meta(&self, key: &str, value: &str) -> FmdResult<()> {
        let conn = self.conn("set_meta", key)?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| storage_error("set_meta", key, e))?;
        Ok(())
    }

    fn position_expiry(&self) -> Duration {
        self.position_expiry
    }

    fn metrics(&self) -> &dyn Metrics {
        self.metrics.as_ref()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::observability::NoopMetrics;
    use tempfile::TempDir;

    pub(crate) fn store_with(config: StorageConfig, metrics: Arc<dyn Metrics>) -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("fmd.db"), &config, metrics).unwrap();
        store.init().unwrap();
        (tmp, store)
    }

    pub(crate) fn test_store() -> (TempDir, SqliteStore) {
        store_with(StorageConfig::default(), Arc::new(NoopMetrics))
    }

    /// Count rows of `table` matching `device_id`.
    pub(crate) fn count_rows(store: &SqliteStore, table: &str, device_id: &str) -> i64 {
        let conn = store.conn("count", device_id).unwrap();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE device_id = ?1"),
            params![device_id],
            |row| row.get(0),
        )
        .unwrap()
    }
}
