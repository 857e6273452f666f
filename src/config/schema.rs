use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default registry key of the storage backend.
pub const DEFAULT_BACKEND: &str = "sqlite";

/// Default per-user device mapping cap.
pub const DEFAULT_MAX_DEVICES_PER_USER: u32 = 1;

/// Default position expiry: 5 days.
pub const DEFAULT_POSITION_EXPIRY_SECS: u64 = 5 * 24 * 3600;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub hawk: HawkConfig,
    pub observability: ObservabilityConfig,
}

/// Backing store selection and limits.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    /// Registry key of the backend (`sqlite`, or `postgres` with the
    /// `storage-postgres` feature).
    pub backend: String,
    /// SQLite database file. `~` is expanded.
    pub path: String,
    /// Postgres connection string.
    pub dsn: String,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// Upper bound on pool checkout, lock waits and statements (ms).
    pub timeout_ms: u64,
    /// Maximum device mappings listed per user.
    pub max_devices_per_user: u32,
    /// Positions older than this are garbage collected (seconds).
    pub position_expiry_secs: u64,
    /// Interval of the periodic GC pass (seconds).
    pub gc_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.into(),
            path: "~/.findmydevice/fmd.db".into(),
            dsn: String::new(),
            pool_size: 8,
            timeout_ms: 5000,
            max_devices_per_user: DEFAULT_MAX_DEVICES_PER_USER,
            position_expiry_secs: DEFAULT_POSITION_EXPIRY_SECS,
            gc_interval_secs: 3600,
        }
    }
}

/// Hawk canonicalization switches.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HawkConfig {
    /// Ignore the Host header port and use the scheme default (80/443).
    /// Set this behind a reverse proxy that rewrites ports.
    pub override_port: bool,
    /// Log canonical strings and payload hashes at debug level.
    pub show_hash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}
