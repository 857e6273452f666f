//! PostgreSQL storage backend.
//!
//! One synchronous client behind a mutex. The lock wait and the server-side
//! `statement_timeout` both use the configured bound; exceeding either
//! surfaces [`FmdError::Timeout`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use postgres::error::SqlState;
use postgres::{Client, NoTls};

use crate::config::StorageConfig;
use crate::error::{FmdError, FmdResult};
use crate::ident;
use crate::observability::Metrics;

use super::models::{Device, DeviceListEntry, PendingCommand, Position};
use super::{
    cutoff_secs, epoch_secs, CommandQueue, DeviceStore, NonceRows, PositionStore, Storage,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS device (
        device_id     TEXT PRIMARY KEY,
        lockable      BOOLEAN NOT NULL DEFAULT FALSE,
        logged_in     BOOLEAN NOT NULL DEFAULT FALSE,
        last_exchange BIGINT NOT NULL,
        hawk_secret   TEXT NOT NULL DEFAULT '',
        push_url      TEXT NOT NULL DEFAULT '',
        accepts       TEXT NOT NULL DEFAULT '',
        access_token  TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS user_device_map (
        user_id   TEXT NOT NULL,
        device_id TEXT NOT NULL,
        name      TEXT,
        date      BIGINT NOT NULL,
        PRIMARY KEY (user_id, device_id)
    );
    CREATE INDEX IF NOT EXISTS idx_user_device_map_device ON user_device_map(device_id);

    CREATE TABLE IF NOT EXISTS pending_command (
        id        BIGSERIAL PRIMARY KEY,
        device_id TEXT NOT NULL,
        time      BIGINT NOT NULL,
        cmd       TEXT NOT NULL,
        type      TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_command_key ON pending_command(device_id, type);

    CREATE TABLE IF NOT EXISTS position (
        id        BIGSERIAL PRIMARY KEY,
        device_id TEXT NOT NULL,
        time      BIGINT NOT NULL,
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
        time BIGINT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_nonce_time ON nonce(time);
";

const DEVICE_TABLES: [&str; 4] = ["pending_command", "position", "user_device_map", "device"];

/// PostgreSQL-backed [`Storage`].
pub struct PostgresStore {
    client: Mutex<Client>,
    metrics: Arc<dyn Metrics>,
    timeout: Duration,
    max_devices: u32,
    position_expiry: Duration,
}

/// Registry constructor.
pub(crate) fn open_backend(
    config: &StorageConfig,
    metrics: Arc<dyn Metrics>,
) -> FmdResult<Arc<dyn Storage>> {
    Ok(Arc::new(PostgresStore::connect(config, metrics)?))
}

impl PostgresStore {
    /// Connect using `config.dsn`.
    pub fn connect(config: &StorageConfig, metrics: Arc<dyn Metrics>) -> FmdResult<Self> {
        let timeout = config.timeout();
        let mut pg: postgres::Config = config.dsn.parse().map_err(|e: postgres::Error| {
            FmdError::Config {
                message: format!("Invalid postgres dsn: {e}"),
            }
        })?;
        pg.connect_timeout(timeout)
            .options(&format!("-c statement_timeout={}", timeout.as_millis()));
        let client = pg
            .connect(NoTls)
            .map_err(|e| pg_error("connect", "", e))?;

        Ok(Self {
            client: Mutex::new(client),
            metrics,
            timeout,
            max_devices: config.max_devices_per_user,
            position_expiry: Duration::from_secs(config.position_expiry_secs),
        })
    }

    /// Run `f` with the client, waiting at most the configured timeout.
    fn with_client<T>(
        &self,
        operation: &'static str,
        key: &str,
        f: impl FnOnce(&mut Client) -> Result<T, postgres::Error>,
    ) -> FmdResult<T> {
        let mut client = self.client.try_lock_for(self.timeout).ok_or_else(|| {
            tracing::warn!(operation, key, "Storage client busy");
            FmdError::Timeout {
                operation,
                key: key.to_string(),
            }
        })?;
        f(&mut client).map_err(|e| pg_error(operation, key, e))
    }
}

fn pg_error(operation: &'static str, key: &str, err: postgres::Error) -> FmdError {
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
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

impl DeviceStore for PostgresStore {
    fn register_device(&self, user_id: &str, device: &Device) -> FmdResult<String> {
        let device_id = if device.id.is_empty() {
            ident::gen_uuid4()
        } else {
            device.id.clone()
        };
        let name = (!device.name.is_empty()).then_some(device.name.as_str());
        let now = epoch_secs();
        let date = chrono::Utc::now().timestamp_millis();

        self.with_client("register_device", &device_id, |client| {
            let mut tx = client.transaction()?;
            let owned = tx
                .query_opt(
                    "SELECT 1 FROM user_device_map WHERE user_id = $1 AND device_id = $2",
                    &[&user_id, &device_id],
                )?
                .is_some();
            if owned {
                tx.execute(
                    "UPDATE device SET lockable = $1, logged_in = $2, last_exchange = $3,
                            hawk_secret = $4, accepts = $5, push_url = $6
                     WHERE device_id = $7",
                    &[
                        &device.has_passcode,
                        &device.logged_in,
                        &now,
                        &device.secret,
                        &device.accepts,
                        &device.push_url,
                        &device_id,
                    ],
                )?;
                if let Some(name) = name {
                    tx.execute(
                        "UPDATE user_device_map SET name = $1 WHERE user_id = $2 AND device_id = $3",
                        &[&name, &user_id, &device_id],
                    )?;
                }
            } else {
                tx.execute(
                    "INSERT INTO device (device_id, lockable, logged_in, last_exchange,
                                         hawk_secret, accepts, push_url, access_token)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                    &[
                        &device_id,
                        &device.has_passcode,
                        &device.logged_in,
                        &now,
                        &device.secret,
                        &device.accepts,
                        &device.push_url,
                        &device.access_token,
                    ],
                )?;
                tx.execute(
                    "INSERT INTO user_device_map (user_id, device_id, name, date)
                     VALUES ($1, $2, $3, $4)",
                    &[&user_id, &device_id, &name, &date],
                )?;
            }
            tx.commit()
        })?;
        Ok(device_id)
    }

    fn get_device_info(&self, device_id: &str) -> FmdResult<Device> {
        let row = self.with_client("get_device_info", device_id, |client| {
            client.query_opt(
                "SELECT d.device_id, u.user_id, COALESCE(u.name, ''), d.lockable, d.push_url,
                        d.accepts, d.hawk_secret, d.last_exchange, d.access_token
                 FROM user_device_map AS u
                 JOIN device AS d ON u.device_id = d.device_id
                 WHERE u.device_id = $1
                 LIMIT 1",
                &[&device_id],
            )
        })?;
        let row = row.ok_or_else(|| FmdError::UnknownDevice {
            device_id: device_id.to_string(),
        })?;
        let push_url: String = row.get(4);
        Ok(Device {
            id: row.get(0),
            user: row.get(1),
            name: row.get(2),
            has_passcode: row.get(3),
            logged_in: !push_url.is_empty(),
            push_url,
            accepts: row.get(5),
            secret: row.get(6),
            last_exchange: row.get(7),
            access_token: row.get(8),
        })
    }

    fn get_user_from_device(&self, device_id: &str) -> FmdResult<(String, String)> {
        self.with_client("get_user_from_device", device_id, |client| {
            client.query_opt(
                "SELECT user_id, COALESCE(name, '') FROM user_device_map WHERE device_id = $1 LIMIT 1",
                &[&device_id],
            )
        })?
        .map(|row| (row.get(0), row.get(1)))
        .ok_or_else(|| FmdError::UnknownDevice {
            device_id: device_id.to_string(),
        })
    }

    fn get_devices_for_user(
        &self,
        user_id: &str,
        old_user_id: Option<&str>,
    ) -> FmdResult<Vec<DeviceListEntry>> {
        let old = old_user_id.filter(|old| !old.is_empty() && *old != user_id);
        let limit = i64::from(self.max_devices);

        self.with_client("get_devices_for_user", user_id, |client| {
            let mut tx = client.transaction()?;
            let mut list_user = user_id;
            if let Some(old) = old {
                let mut sp = tx.transaction()?;
                match sp.execute(
                    "UPDATE user_device_map SET user_id = $1 WHERE user_id = $2",
                    &[&user_id, &old],
                ) {
                    Ok(hits) => {
                        sp.commit()?;
                        self.metrics.increment_by("db.UserID.Updated", hits);
                    }
                    Err(e) => {
                        sp.rollback()?;
                        tracing::error!(user_id, old_user_id = old, error = %e, "Could not update user id");
                        list_user = old;
                    }
                }
            }
            let rows = tx.query(
                "SELECT device_id, COALESCE(name, device_id) FROM user_device_map
                 WHERE user_id = $1
                 ORDER BY date DESC
                 LIMIT $2",
                &[&list_user, &limit],
            )?;
            tx.commit()?;
            Ok(rows
                .iter()
                .map(|row| DeviceListEntry {
                    id: row.get(0),
                    name: row.get(1),
                })
                .collect())
        })
    }

    fn set_access_token(&self, device_id: &str, token: &str) -> FmdResult<()> {
        self.with_client("set_access_token", device_id, |client| {
            client.execute(
                "UPDATE device SET access_token = $1, last_exchange = $2 WHERE device_id = $3",
                &[&token, &epoch_secs(), &device_id],
            )
        })?;
        Ok(())
    }

    fn set_device_lock(&self, device_id: &str, locked: bool) -> FmdResult<()> {
        self.with_client("set_device_lock", device_id, |client| {
            client.execute(
                "UPDATE device SET lockable = $1, last_exchange = $2 WHERE device_id = $3",
                &[&locked, &epoch_secs(), &device_id],
            )
        })?;
        Ok(())
    }

    fn touch(&self, device_id: &str) -> FmdResult<()> {
        self.with_client("touch", device_id, |client| {
            client.execute(
                "UPDATE device SET last_exchange = $1 WHERE device_id = $2",
                &[&epoch_secs(), &device_id],
            )
        })?;
        Ok(())
    }

    fn delete_device(&self, device_id: &str) -> FmdResult<()> {
        self.with_client("delete_device", device_id, |client| {
            let mut tx = client.transaction()?;
            for table in DEVICE_TABLES {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE device_id = $1"),
                    &[&device_id],
                )?;
            }
            tx.commit()
        })?;
        tracing::info!(device_id, "Device deleted");
        Ok(())
    }
}

impl CommandQueue for PostgresStore {
    fn store_command(&self, device_id: &str, command: &str, command_type: &str) -> FmdResult<()> {
        self.with_client("store_command", device_id, |client| {
            client.execute(
                "INSERT INTO pending_command (device_id, time, cmd, type)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (device_id, type) DO UPDATE SET
                    time = EXCLUDED.time,
                    cmd  = EXCLUDED.cmd",
                &[&device_id, &epoch_secs(), &command, &command_type],
            )
        })?;
        tracing::debug!(device_id, command_type, "Command queued");
        Ok(())
    }

    fn get_pending(&self, device_id: &str) -> FmdResult<Option<PendingCommand>> {
        let popped = self.with_client("get_pending", device_id, |client| {
            let mut tx = client.transaction()?;
            let row = tx.query_opt(
                "DELETE FROM pending_command
                 WHERE id = (SELECT id FROM pending_command
                             WHERE device_id = $1
                             ORDER BY time, id
                             LIMIT 1
                             FOR UPDATE SKIP LOCKED)
                 RETURNING cmd, type, time",
                &[&device_id],
            )?;
            tx.execute(
                "UPDATE device SET last_exchange = $1 WHERE device_id = $2",
                &[&epoch_secs(), &device_id],
            )?;
            tx.commit()?;
            Ok(row.map(|row| {
                (
                    PendingCommand {
                        command: row.get(0),
                        command_type: row.get(1),
                    },
                    row.get::<_, i64>(2),
                )
            }))
        })?;

        Ok(popped.map(|(command, queued_at)| {
            let age = u64::try_from(epoch_secs() - queued_at).unwrap_or(0);
            self.metrics.timer("cmd.pending", Duration::from_secs(age));
            command
        }))
    }

    fn purge_commands(&self, device_id: &str) -> FmdResult<()> {
        self.with_client("purge_commands", device_id, |client| {
            client.execute(
                "DELETE FROM pending_command WHERE device_id = $1",
                &[&device_id],
            )
        })?;
        Ok(())
    }
}

impl PositionStore for PostgresStore {
    fn set_device_location(&self, device_id: &str, position: &Position) -> FmdResult<()> {
        let [latitude, longitude, altitude, accuracy] = position.reduced();
        self.with_client("set_device_location", device_id, |client| {
            let mut tx = client.transaction()?;
            tx.execute("DELETE FROM position WHERE device_id = $1", &[&device_id])?;
            tx.execute(
                "INSERT INTO position (device_id, time, latitude, longitude, altitude, accuracy)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[&device_id, &epoch_secs(), &latitude, &longitude, &altitude, &accuracy],
            )?;
            tx.commit()
        })
    }

    fn get_positions(&self, device_id: &str) -> FmdResult<Vec<Position>> {
        let rows = self.with_client("get_positions", device_id, |client| {
            client.query(
                "SELECT time, latitude, longitude, altitude, accuracy FROM position
                 WHERE device_id = $1
                 ORDER BY time DESC, id DESC
                 LIMIT 1",
                &[&device_id],
            )
        })?;
        Ok(rows
            .iter()
            .map(|row| Position {
                time: row.get(0),
                latitude: f64::from(row.get::<_, f32>(1)),
                longitude: f64::from(row.get::<_, f32>(2)),
                altitude: f64::from(row.get::<_, f32>(3)),
                accuracy: f64::from(row.get::<_, f32>(4)),
            })
            .collect())
    }

    fn purge_position(&self, device_id: &str) -> FmdResult<()> {
        self.with_client("purge_position", device_id, |client| {
            client.execute("DELETE FROM position WHERE device_id = $1", &[&device_id])
        })?;
        Ok(())
    }

    fn gc_positions(&self, max_age: Duration) -> FmdResult<usize> {
        let removed = self.with_client("gc_positions", "", |client| {
            client.execute(
                "DELETE FROM position WHERE time < $1",
                &[&cutoff_secs(max_age)],
            )
        })?;
        if removed > 0 {
            tracing::info!(removed, "Expired positions collected");
        }
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }
}

impl NonceRows for PostgresStore {
    fn insert_nonce(&self, key: &str, val: &str) -> FmdResult<()> {
        self.with_client("insert_nonce", key, |client| {
            client.execute(
                "INSERT INTO nonce (key, val, time) VALUES ($1, $2, $3)",
                &[&key, &val, &epoch_secs()],
            )
        })?;
        Ok(())
    }

    fn take_nonce(&self, key: &str, max_age: Duration) -> FmdResult<Option<String>> {
        self.with_client("take_nonce", key, |client| {
            let mut tx = client.transaction()?;
            tx.execute(
                "DELETE FROM nonce WHERE time < $1",
                &[&cutoff_secs(max_age)],
            )?;
            let row = tx.query_opt("DELETE FROM nonce WHERE key = $1 RETURNING val", &[&key])?;
            tx.commit()?;
            Ok(row.map(|row| row.get(0)))
        })
    }

    fn purge_nonces(&self, max_age: Duration) -> FmdResult<usize> {
        let removed = self.with_client("purge_nonces", "", |client| {
            client.execute(
                "DELETE FROM nonce WHERE time < $1",
                &[&cutoff_secs(max_age)],
            )
        })?;
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }
}

impl Storage for PostgresStore {
    fn create_schema(&self) -> FmdResult<()> {
        self.with_client("create_schema", "", |client| client.batch_execute(SCHEMA))
    }

    fn get_meta(&self, key: &str) -> FmdResult<Option<String>> {
        let row = self.with_client("get_meta", key, |client| {
            client.query_opt("SELECT value FROM meta WHERE key = $1", &[&key])
        })?;
        Ok(row.map(|row| row.get(0)))
    }

    fn set_meta(&self, key: &str, value: &str) -> FmdResult<()> {
        self.with_client("set_meta", key, |client| {
            client.execute(
                "INSERT INTO meta (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                &[&key, &value],
            )
        })?;
        Ok(())
    }

    fn position_expiry(&self) -> Duration {
        self.position_expiry
    }

    fn metrics(&self) -> &dyn Metrics {
        self.metrics.as_ref()
    }
}
