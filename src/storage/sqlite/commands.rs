use std::time::Duration;

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::error::FmdResult;
use crate::storage::models::PendingCommand;
use crate::storage::{epoch_secs, CommandQueue};

use super::{storage_error, SqliteStore};

impl CommandQueue for SqliteStore {
    fn store_command(&self, device_id: &str, command: &str, command_type: &str) -> FmdResult<()> {
        let conn = self.conn("store_command", device_id)?;
        conn.execute(
            "INSERT INTO pending_command (device_id, time, cmd, type)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id, type) DO UPDATE SET
                time = excluded.time,
                cmd  = excluded.cmd",
            params![device_id, epoch_secs(), command, command_type],
        )
        .map_err(|e| storage_error("store_command", device_id, e))?;
        tracing::debug!(device_id, command_type, "Command queued");
        Ok(())
    }

    fn get_pending(&self, device_id: &str) -> FmdResult<Option<PendingCommand>> {
        let err = |e| storage_error("get_pending", device_id, e);
        let mut conn = self.conn("get_pending", device_id)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;

        let popped = tx
            .query_row(
                "DELETE FROM pending_command
                 WHERE id = (SELECT id FROM pending_command
                             WHERE device_id = ?1
                             ORDER BY time, id
                             LIMIT 1)
                 RETURNING cmd, type, time",
                params![device_id],
                |row| {
                    Ok((
                        PendingCommand {
                            command: row.get(0)?,
                            command_type: row.get(1)?,
                        },
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(err)?;

        tx.execute(
            "UPDATE device SET last_exchange = ?1 WHERE device_id = ?2",
            params![epoch_secs(), device_id],
        )
        .map_err(err)?;
        tx.commit().map_err(err)?;

        let Some((command, queued_at)) = popped else {
            return Ok(None);
        };
        let age = u64::try_from(epoch_secs() - queued_at).unwrap_or(0);
        self.metrics.timer("cmd.pending", Duration::from_secs(age));
        tracing::debug!(device_id, command_type = %command.command_type, "Command delivered");
        Ok(Some(command))
    }

    fn purge_commands(&self, device_id: &str) -> FmdResult<()> {
        let conn = self.conn("purge_commands", device_id)?;
        conn.execute(
            "DELETE FROM pending_command WHERE device_id = ?1",
            params![device_id],
        )
        .map_err(|e| storage_error("purge_commands", device_id, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::*;
    use super::*;
    use crate::config::StorageConfig;
    use crate::observability::PrometheusMetrics;
    use crate::storage::{Device, DeviceStore};

    fn register(store: &SqliteStore, id: &str) {
        let device = Device {
            id: id.into(),
            secret: "s".into(),
            ..Device::default()
        };
        store.register_device("user-1", &device).unwrap();
    }

    #[test]
    fn same_type_replaces_payload() {
        let (_tmp, store) = test_store();
        register(&store, "dev-1");
        store.store_command("dev-1", "first", "l").unwrap();
        store.store_command("dev-1", "second", "l").unwrap();
        assert_eq!(count_rows(&store, "pending_command", "dev-1"), 1);

        let cmd = store.get_pending("dev-1").unwrap().unwrap();
        assert_eq!(cmd.command, "second");
        assert_eq!(cmd.command_type, "l");
        assert_eq!(store.get_pending("dev-1").unwrap(), None);
    }

    #[test]
    fn different_types_queue_oldest_first() {
        let (_tmp, store) = test_store();
        register(&store, "dev-1");
        store.store_command("dev-1", "lock", "l").unwrap();
        store.store_command("dev-1", "erase", "e").unwrap();
        {
            let conn = store.conn("test", "").unwrap();
            conn.execute("UPDATE pending_command SET time = time - 60 WHERE type = 'e'", [])
                .unwrap();
        }

        assert_eq!(store.get_pending("dev-1").unwrap().unwrap().command, "erase");
        assert_eq!(store.get_pending("dev-1").unwrap().unwrap().command, "lock");
        assert!(store.get_pending("dev-1").unwrap().is_none());
    }

    #[test]
    fn pop_touches_device_and_records_age() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let (_tmp, store) = store_with(StorageConfig::default(), metrics.clone());
        register(&store, "dev-1");
        store.store_command("dev-1", "lock", "l").unwrap();
        {
            let conn = store.conn("test", "").unwrap();
            conn.execute("UPDATE device SET last_exchange = 0", []).unwrap();
        }

        store.get_pending("dev-1").unwrap().unwrap();
        assert!(store.get_device_info("dev-1").unwrap().last_exchange > 0);
        assert_eq!(metrics.timer_count("cmd.pending"), 1);
    }

    #[test]
    fn empty_poll_still_touches_device() {
        let (_tmp, store) = test_store();
        register(&store, "dev-1");
        {
            let conn = store.conn("test", "").unwrap();
            conn.execute("UPDATE device SET last_exchange = 0", []).unwrap();
        }
        assert!(store.get_pending("dev-1").unwrap().is_none());
        assert!(store.get_device_info("dev-1").unwrap().last_exchange > 0);
    }

    #[test]
    fn queues_are_per_device() {
        let (_tmp, store) = test_store();
        register(&store, "dev-1");
        register(&store, "dev-2");
        store.store_command("dev-1", "lock", "l").unwrap();
        store.store_command("dev-2", "ring", "l").unwrap();

        store.purge_commands("dev-1").unwrap();
        assert!(store.get_pending("dev-1").unwrap().is_none());
        assert_eq!(store.get_pending("dev-2").unwrap().unwrap().command, "ring");
    }

    #[test]
    fn concurrent_pops_deliver_once() {
        let (_tmp, store) = test_store();
        register(&store, "dev-1");
        store.store_command("dev-1", "lock", "l").unwrap();

        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.get_pending("dev-1").unwrap())
            })
            .collect();
        let delivered = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(delivered, 1);
    }
}
