//! Device, command, position and nonce persistence.
//!
//! The backing store is the only synchronization point between requests:
//! nothing here caches secrets, nonces or commands in memory. Every
//! operation is bounded by the configured timeout and surfaces
//! [`FmdError::Timeout`] instead of retrying, since commands and nonces are
//! single-use.
//!
//! Tables: `meta`, `device`, `user_device_map`, `pending_command`,
//! `position`, `nonce`.

pub mod models;
pub mod registry;
pub mod sqlite;

#[cfg(feature = "storage-postgres")]
pub mod postgres;

pub use models::{Device, DeviceListEntry, GcReport, PendingCommand, Position};
pub use registry::{StorageFactory, StorageRegistry};
pub use sqlite::SqliteStore;

use std::time::Duration;

use crate::error::{FmdError, FmdResult};
use crate::observability::Metrics;

/// Schema marker written to `meta["db.ver"]`.
pub const DB_VERSION: &str = "20260101";

/// Meta key holding [`DB_VERSION`].
pub const DB_VERSION_KEY: &str = "db.ver";

/// Issued nonces older than this are discarded before every lookup.
pub const NONCE_TTL: Duration = Duration::from_secs(5 * 60);

// ── Device registry ─────────────────────────────────────────────

pub trait DeviceStore {
    /// Register `device` under `user_id` and return its resolved id.
    ///
    /// A device already mapped to the user is updated in place (lock flag,
    /// login state, last exchange, secret, accepted types, push URL);
    /// otherwise a device row and a mapping row are inserted.
    fn register_device(&self, user_id: &str, device: &Device) -> FmdResult<String>;

    /// Device row joined with its owning user mapping.
    fn get_device_info(&self, device_id: &str) -> FmdResult<Device>;

    /// `(user_id, display_name)` owning a device.
    fn get_user_from_device(&self, device_id: &str) -> FmdResult<(String, String)>;

    /// Devices of `user_id`, newest mapping first, capped at the configured
    /// per-user limit. When `old_user_id` differs, its mappings are re-keyed
    /// to `user_id` first; a failed re-key falls back to listing under the
    /// old id.
    fn get_devices_for_user(
        &self,
        user_id: &str,
        old_user_id: Option<&str>,
    ) -> FmdResult<Vec<DeviceListEntry>>;

    fn set_access_token(&self, device_id: &str, token: &str) -> FmdResult<()>;

    fn set_device_lock(&self, device_id: &str, locked: bool) -> FmdResult<()>;

    /// Refresh `last_exchange`.
    fn touch(&self, device_id: &str) -> FmdResult<()>;

    /// Remove pending commands, positions, mapping and device rows.
    fn delete_device(&self, device_id: &str) -> FmdResult<()>;
}

// ── Command queue ───────────────────────────────────────────────

pub trait CommandQueue {
    /// Enqueue, replacing any pending command of the same type.
    fn store_command(&self, device_id: &str, command: &str, command_type: &str) -> FmdResult<()>;

    /// Pop the oldest pending command of any type. Every poll touches the
    /// device, queued command or not; `None` when nothing is queued.
    fn get_pending(&self, device_id: &str) -> FmdResult<Option<PendingCommand>>;

    fn purge_commands(&self, device_id: &str) -> FmdResult<()>;
}

// ── Position tracker ────────────────────────────────────────────

pub trait PositionStore {
    /// Replace the device's position with `position`.
    fn set_device_location(&self, device_id: &str, position: &Position) -> FmdResult<()>;

    /// The retained position as a zero- or one-element list.
    fn get_positions(&self, device_id: &str) -> FmdResult<Vec<Position>>;

    fn purge_position(&self, device_id: &str) -> FmdResult<()>;

    /// Delete positions older than `max_age`, for any device.
    fn gc_positions(&self, max_age: Duration) -> FmdResult<usize>;
}

// ── Nonce rows ──────────────────────────────────────────────────

/// Raw nonce persistence. Checksums live in [`crate::auth::NonceStore`].
pub trait NonceRows {
    fn insert_nonce(&self, key: &str, val: &str) -> FmdResult<()>;

    /// Purge nonces older than `max_age`, then atomically delete and return
    /// the value stored under `key`. Concurrent callers for the same key
    /// see the value at most once.
    fn take_nonce(&self, key: &str, max_age: Duration) -> FmdResult<Option<String>>;

    fn purge_nonces(&self, max_age: Duration) -> FmdResult<usize>;
}

// ── Storage backend ─────────────────────────────────────────────

/// A complete storage backend.
pub trait Storage: DeviceStore + CommandQueue + PositionStore + NonceRows + Send + Sync {
    /// Create missing tables and indexes. Idempotent.
    fn create_schema(&self) -> FmdResult<()>;

    fn get_meta(&self, key: &str) -> FmdResult<Option<String>>;

    fn set_meta(&self, key: &str, value: &str) -> FmdResult<()>;

    /// Positions older than this are collected by [`Storage::gc_database`].
    fn position_expiry(&self) -> Duration;

    fn metrics(&self) -> &dyn Metrics;

    /// Bring the schema up and validate its version marker.
    ///
    /// A marker from another schema version is fatal; migrations are run
    /// by external tooling.
    fn init(&self) -> FmdResult<()> {
        self.create_schema()?;
        match self.get_meta(DB_VERSION_KEY)? {
            Some(found) if found == DB_VERSION => {
                tracing::info!(version = DB_VERSION, "Database up to date");
                Ok(())
            }
            Some(found) => Err(FmdError::SchemaMismatch {
                expected: DB_VERSION.to_string(),
                found,
            }),
            None => {
                tracing::info!(version = DB_VERSION, "Marking new database");
                self.set_meta(DB_VERSION_KEY, DB_VERSION)
            }
        }
    }

    /// Collect expired positions and stale nonces.
    fn gc_database(&self) -> FmdResult<GcReport> {
        let positions = self.gc_positions(self.position_expiry())?;
        let nonces = self.purge_nonces(NONCE_TTL)?;
        self.metrics().increment_by("position.gc", positions as u64);
        tracing::info!(positions, nonces, "Garbage collection complete");
        Ok(GcReport { positions, nonces })
    }
}

/// Current Unix seconds.
pub(crate) fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Unix seconds `max_age` ago.
pub(crate) fn cutoff_secs(max_age: Duration) -> i64 {
    epoch_secs().saturating_sub(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX))
}
