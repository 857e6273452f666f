use std::time::Duration;

use rusqlite::{params, TransactionBehavior};

use crate::error::FmdResult;
use crate::storage::models::Position;
use crate::storage::{cutoff_secs, epoch_secs, PositionStore};

use super::{storage_error, SqliteStore};

impl PositionStore for SqliteStore {
    fn set_device_location(&self, device_id: &str, position: &Position) -> FmdResult<()> {
        let err = |e| storage_error("set_device_location", device_id, e);
        let [latitude, longitude, altitude, accuracy] = position.reduced();

        let mut conn = self.conn("set_device_location", device_id)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(err)?;
        tx.execute("DELETE FROM position WHERE device_id = ?1", params![device_id])
            .map_err(err)?;
        tx.execute(
            "INSERT INTO position (device_id, time, latitude, longitude, altitude, accuracy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![device_id, epoch_secs(), latitude, longitude, altitude, accuracy],
        )
        .map_err(err)?;
        tx.commit().map_err(err)
    }

    fn get_positions(&self, device_id: &str) -> FmdResult<Vec<Position>> {
        let err = |e| storage_error("get_positions", device_id, e);
        let conn = self.conn("get_positions", device_id)?;
        let mut stmt = conn
            .prepare(
                "SELECT time, latitude, longitude, altitude, accuracy FROM position
                 WHERE device_id = ?1
                 ORDER BY time DESC, id DESC
                 LIMIT 1",
            )
            .map_err(err)?;
        let positions = stmt
            .query_map(params![device_id], |row| {
                Ok(Position {
                    time: row.get(0)?,
                    latitude: row.get(1)?,
                    longitude: row.get(2)?,
                    altitude: row.get(3)?,
                    accuracy: row.get(4)?,
                })
            })
            .map_err(err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(err)?;
        Ok(positions)
    }

    fn purge_position(&self, device_id: &str) -> FmdResult<()> {
        let conn = self.conn("purge_position", device_id)?;
        conn.execute("DELETE FROM position WHERE device_id = ?1", params![device_id])
            .map_err(|e| storage_error("purge_position", device_id, e))?;
        Ok(())
    }

    fn gc_positions(&self, max_age: Duration) -> FmdResult<usize> {
        let conn = self.conn("gc_positions", "")?;
        let removed = conn
            .execute(
                "DELETE FROM position WHERE time < ?1",
                params![cutoff_secs(max_age)],
            )
            .map_err(|e| storage_error("gc_positions", "", e))?;
        if removed > 0 {
            tracing::info!(removed, "Expired positions collected");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn backdate(store: &SqliteStore, device_id: &str, secs: i64) {
        let conn = store.conn("test", device_id).unwrap();
        conn.execute(
            "UPDATE position SET time = time - ?1 WHERE device_id = ?2",
            params![secs, device_id],
        )
        .unwrap();
    }

    #[test]
    fn only_latest_position_is_kept() {
        let (_tmp, store) = test_store();
        store
            .set_device_location("dev-1", &Position::new(1.0, 2.0, 3.0, 4.0))
            .unwrap();
        store
            .set_device_location("dev-1", &Position::new(5.0, 6.0, 7.0, 8.0))
            .unwrap();

        assert_eq!(count_rows(&store, "position", "dev-1"), 1);
        let positions = store.get_positions("dev-1").unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].latitude, 5.0);
        assert_eq!(positions[0].accuracy, 8.0);
        assert!(positions[0].time > 0);
    }

    #[test]
    fn coordinates_round_trip_at_single_precision() {
        let (_tmp, store) = test_store();
        let fix = Position::new(37.123_456_789_123, -122.987_654_321, 15.5, 9.75);
        store.set_device_location("dev-1", &fix).unwrap();

        let stored = store.get_positions("dev-1").unwrap()[0];
        let [lat, lon, _, _] = fix.reduced();
        assert_eq!(stored.latitude, f64::from(lat));
        assert_eq!(stored.longitude, f64::from(lon));
    }

    #[test]
    fn unknown_device_has_no_positions() {
        let (_tmp, store) = test_store();
        assert!(store.get_positions("ghost").unwrap().is_empty());
    }

    #[test]
    fn purge_removes_device_position() {
        let (_tmp, store) = test_store();
        store
            .set_device_location("dev-1", &Position::new(1.0, 2.0, 0.0, 0.0))
            .unwrap();
        store.purge_position("dev-1").unwrap();
        assert!(store.get_positions("dev-1").unwrap().is_empty());
    }

    #[test]
    fn gc_drops_only_expired() {
        let (_tmp, store) = test_store();
        store
            .set_device_location("old", &Position::new(1.0, 2.0, 0.0, 0.0))
            .unwrap();
        store
            .set_device_location("fresh", &Position::new(3.0, 4.0, 0.0, 0.0))
            .unwrap();
        backdate(&store, "old", 2 * 3600);

        let removed = store.gc_positions(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_positions("old").unwrap().is_empty());
        assert_eq!(store.get_positions("fresh").unwrap().len(), 1);
    }

    #[test]
    fn gc_database_uses_configured_expiry() {
        use crate::storage::Storage;

        let (_tmp, store) = test_store();
        store
            .set_device_location("dev-1", &Position::new(1.0, 2.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(store.gc_database().unwrap().positions, 0);

        let expiry = i64::try_from(store.position_expiry().as_secs()).unwrap();
        backdate(&store, "dev-1", expiry + 10);
        assert_eq!(store.gc_database().unwrap().positions, 1);
    }
}
