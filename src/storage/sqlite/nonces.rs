use std::time::Duration;

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::error::FmdResult;
use crate::storage::{cutoff_secs, epoch_secs, NonceRows};

use super::{storage_error, SqliteStore};

impl NonceRows for SqliteStore {
    fn insert_nonce(&self, key: &str, val: &str) -> FmdResult<()> {
        let conn = self.conn("insert_nonce", key)?;
        conn.execute(
            "INSERT INTO nonce (key, val, time) VALUES (?1, ?2, ?3)",
            params![key, val, epoch_secs()],
        )
        .map_err(|e| storage_error("insert_nonce", key, e))?;
        Ok(())
    }

    fn take_nonce(&self, key: &str, max_age: Duration) -> FmdResult<Option<String>> {
        let err = |e| storage_error("take_nonce", key, e);
        let mut conn = self.conn("take_nonce", key)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;
        tx.execute(
            "DELETE FROM nonce WHERE time < ?1",
            params![cutoff_secs(max_age)],
        )
        .map_err(err)?;
        let val = tx
            .query_row(
                "DELETE FROM nonce WHERE key = ?1 RETURNING val",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(err)?;
        tx.commit().map_err(err)?;
        Ok(val)
    }

    fn purge_nonces(&self, max_age: Duration) -> FmdResult<usize> {
        let conn = self.conn("purge_nonces", "")?;
        conn.execute(
            "DELETE FROM nonce WHERE time < ?1",
            params![cutoff_secs(max_age)],
        )
        .map_err(|e| storage_error("purge_nonces", "", e))
    }
}
