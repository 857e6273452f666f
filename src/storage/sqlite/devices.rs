use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::error::{FmdError, FmdResult};
use crate::ident;
use crate::storage::models::{Device, DeviceListEntry};
use crate::storage::{epoch_secs, DeviceStore};

use super::{storage_error, SqliteStore};

/// Tables holding per-device rows, in cleanup order.
const DEVICE_TABLES: [&str; 4] = ["pending_command", "position", "user_device_map", "device"];

impl DeviceStore for SqliteStore {
    fn register_device(&self, user_id: &str, device: &Device) -> FmdResult<String> {
        let device_id = if device.id.is_empty() {
            ident::gen_uuid4()
        } else {
            device.id.clone()
        };
        let err = |e| storage_error("register_device", &device_id, e);
        let now = epoch_secs();
        let name = (!device.name.is_empty()).then_some(device.name.as_str());

        let mut conn = self.conn("register_device", &device_id)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;

        let owned = tx
            .query_row(
                "SELECT 1 FROM user_device_map WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(err)?
            .is_some();

        if owned {
            tracing::debug!(user_id, device_id = %device_id, "Updating registered device");
            tx.execute(
                "UPDATE device SET lockable = ?1, logged_in = ?2, last_exchange = ?3,
                        hawk_secret = ?4, accepts = ?5, push_url = ?6
                 WHERE device_id = ?7",
                params![
                    device.has_passcode,
                    device.logged_in,
                    now,
                    device.secret,
                    device.accepts,
                    device.push_url,
                    device_id,
                ],
            )
            .map_err(err)?;
            if let Some(name) = name {
                tx.execute(
                    "UPDATE user_device_map SET name = ?1 WHERE user_id = ?2 AND device_id = ?3",
                    params![name, user_id, device_id],
                )
                .map_err(err)?;
            }
        } else {
            tracing::debug!(user_id, device_id = %device_id, "Registering new device");
            tx.execute(
                "INSERT INTO device (device_id, lockable, logged_in, last_exchange,
                                     hawk_secret, accepts, push_url, access_token)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    device_id,
                    device.has_passcode,
                    device.logged_in,
                    now,
                    device.secret,
                    device.accepts,
                    device.push_url,
                    device.access_token,
                ],
            )
            .map_err(err)?;
            tx.execute(
                "INSERT INTO user_device_map (user_id, device_id, name, date)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, device_id, name, chrono::Utc::now().timestamp_millis()],
            )
            .map_err(err)?;
        }

        tx.commit().map_err(err)?;
        Ok(device_id)
    }

    fn get_device_info(&self, device_id: &str) -> FmdResult<Device> {
        let conn = self.conn("get_device_info", device_id)?;
        let device = conn
            .query_row(
                "SELECT d.device_id, u.user_id, COALESCE(u.name, ''), d.lockable, d.push_url,
                        d.accepts, d.hawk_secret, d.last_exchange, d.access_token
                 FROM user_device_map AS u
                 JOIN device AS d ON u.device_id = d.device_id
                 WHERE u.device_id = ?1
                 LIMIT 1",
                params![device_id],
                |row| {
                    let push_url: String = row.get(4)?;
                    Ok(Device {
                        id: row.get(0)?,
                        user: row.get(1)?,
                        name: row.get(2)?,
                        has_passcode: row.get(3)?,
                        logged_in: !push_url.is_empty(),
                        push_url,
                        accepts: row.get(5)?,
                        secret: row.get(6)?,
                        last_exchange: row.get(7)?,
                        access_token: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage_error("get_device_info", device_id, e))?;

        device.ok_or_else(|| FmdError::UnknownDevice {
            device_id: device_id.to_string(),
        })
    }

    fn get_user_from_device(&self, device_id: &str) -> FmdResult<(String, String)> {
        let conn = self.conn("get_user_from_device", device_id)?;
        conn.query_row(
            "SELECT user_id, COALESCE(name, '') FROM user_device_map WHERE device_id = ?1 LIMIT 1",
            params![device_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| storage_error("get_user_from_device", device_id, e))?
        .ok_or_else(|| FmdError::UnknownDevice {
            device_id: device_id.to_string(),
        })
    }

    fn get_devices_for_user(
        &self,
        user_id: &str,
        old_user_id: Option<&str>,
    ) -> FmdResult<Vec<DeviceListEntry>> {
        let err = |e| storage_error("get_devices_for_user", user_id, e);
        let rekey_from = old_user_id.filter(|old| !old.is_empty() && *old != user_id);
        let behavior = if rekey_from.is_some() {
            TransactionBehavior::Immediate
        } else {
            TransactionBehavior::Deferred
        };
        let mut conn = self.conn("get_devices_for_user", user_id)?;
        let mut tx = conn.transaction_with_behavior(behavior).map_err(err)?;

        let mut list_user = user_id;
        if let Some(old) = rekey_from {
            let sp = tx.savepoint().map_err(err)?;
            match sp.execute(
                "UPDATE user_device_map SET user_id = ?1 WHERE user_id = ?2",
                params![user_id, old],
            ) {
                Ok(hits) => {
                    sp.commit().map_err(err)?;
                    self.metrics.increment_by("db.UserID.Updated", hits as u64);
                }
                Err(e) => {
                    // Savepoint rolls back on drop; keep serving the old identity.
                    tracing::error!(user_id, old_user_id = old, error = %e, "Could not update user id");
                    list_user = old;
                }
            }
        }

        let mut stmt = tx
            .prepare(
                "SELECT device_id, COALESCE(name, device_id) FROM user_device_map
                 WHERE user_id = ?1
                 ORDER BY date DESC, rowid DESC
                 LIMIT ?2",
            )
            .map_err(err)?;
        let devices = stmt
            .query_map(params![list_user, i64::from(self.max_devices)], |row| {
                Ok(DeviceListEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(err)?;
        drop(stmt);

        tx.commit().map_err(err)?;
        Ok(devices)
    }

    fn set_access_token(&self, device_id: &str, token: &str) -> FmdResult<()> {
        let conn = self.conn("set_access_token", device_id)?;
        conn.execute(
            "UPDATE device SET access_token = ?1, last_exchange = ?2 WHERE device_id = ?3",
            params![token, epoch_secs(), device_id],
        )
        .map_err(|e| storage_error("set_access_token", device_id, e))?;
        Ok(())
    }

    fn set_device_lock(&self, device_id: &str, locked: bool) -> FmdResult<()> {
        let conn = self.conn("set_device_lock", device_id)?;
        conn.execute(
            "UPDATE device SET lockable = ?1, last_exchange = ?2 WHERE device_id = ?3",
            params![locked, epoch_secs(), device_id],
        )
        .map_err(|e| storage_error("set_device_lock", device_id, e))?;
        Ok(())
    }

    fn touch(&self, device_id: &str) -> FmdResult<()> {
        let conn = self.conn("touch", device_id)?;
        conn.execute(
            "UPDATE device SET last_exchange = ?1 WHERE device_id = ?2",
            params![epoch_secs(), device_id],
        )
        .map_err(|e| storage_error("touch", device_id, e))?;
        Ok(())
    }

    fn delete_device(&self, device_id: &str) -> FmdResult<()> {
        let err = |e| storage_error("delete_device", device_id, e);
        let mut conn = self.conn("delete_device", device_id)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;
        for table in DEVICE_TABLES {
            tx.execute(
                &format!("DELETE FROM {table} WHERE device_id = ?1"),
                params![device_id],
            )
            .map_err(|e| {
                tracing::error!(device_id, table, "Could not purge data from table");
                err(e)
            })?;
        }
        tx.commit().map_err(err)?;
        tracing::info!(device_id, "Device deleted");
        Ok(())
    }
}
