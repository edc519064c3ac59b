// =============================================================================
// CandleStore — persisted series partition over SQLite
// =============================================================================
//
// One table per series, keyed by OpenTime (epoch ms). All writes are
// idempotent per row; the discipline across writers is last-writer-wins per
// OpenTime with no cross-row transaction.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use crate::error::FeedError;
use crate::types::{Candle, Series};

pub struct CandleStore {
    conn: Mutex<Connection>,
    table: String,
}

impl CandleStore {
    /// Open (or create) the database file and ensure the series table exists.
    pub fn open(path: impl AsRef<Path>, series: &Series) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous pragma")?;

        Self::with_connection(conn, series)
    }

    /// In-memory store, used by tests and dry runs.
    pub fn in_memory(series: &Series) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::with_connection(conn, series)
    }

    fn with_connection(conn: Connection, series: &Series) -> Result<Self> {
        let table = series.table_name();

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS `{table}` (
                    OpenTime INTEGER PRIMARY KEY,
                    Open     REAL NOT NULL,
                    High     REAL NOT NULL,
                    Low      REAL NOT NULL,
                    Close    REAL NOT NULL,
                    Volume   REAL NOT NULL
                )"
            ),
            [],
        )
        .map_err(FeedError::Store)
        .with_context(|| format!("failed to create table {table}"))?;

        info!(table = %table, "candle table ready");

        Ok(Self {
            conn: Mutex::new(conn),
            table,
        })
    }

    pub fn insert(&self, candle: &Candle) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO `{}` (OpenTime, Open, High, Low, Close, Volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                self.table
            ),
            params![
                candle.open_time,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume
            ],
        )
        .map_err(FeedError::Store)
        .with_context(|| format!("insert into {} failed", self.table))?;
        Ok(())
    }

    /// Bulk insert inside one transaction. Rows that collide on OpenTime
    /// replace the existing row (last writer wins).
    pub fn insert_batch(&self, candles: &[Candle]) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(FeedError::Store)
            .context("failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT OR REPLACE INTO `{}` (OpenTime, Open, High, Low, Close, Volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    self.table
                ))
                .map_err(FeedError::Store)?;
            for c in candles {
                stmt.execute(params![c.open_time, c.open, c.high, c.low, c.close, c.volume])
                    .map_err(FeedError::Store)?;
            }
        }
        tx.commit()
            .map_err(FeedError::Store)
            .with_context(|| format!("batch insert into {} failed", self.table))?;
        Ok(())
    }

    /// Point update by OpenTime. Returns whether a row was touched.
    pub fn update_at(&self, candle: &Candle) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                &format!(
                    "UPDATE `{}` SET Open = ?2, High = ?3, Low = ?4, Close = ?5, Volume = ?6
                     WHERE OpenTime = ?1",
                    self.table
                ),
                params![
                    candle.open_time,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume
                ],
            )
            .map_err(FeedError::Store)
            .with_context(|| format!("update in {} failed", self.table))?;
        Ok(n > 0)
    }

    /// Point delete by OpenTime. Returns whether a row was removed.
    pub fn delete_at(&self, open_time: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                &format!("DELETE FROM `{}` WHERE OpenTime = ?1", self.table),
                params![open_time],
            )
            .map_err(FeedError::Store)
            .with_context(|| format!("delete from {} failed", self.table))?;
        Ok(n > 0)
    }

    pub fn exists_at(&self, open_time: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM `{}` WHERE OpenTime = ?1)",
                self.table
            ),
            params![open_time],
            |row| row.get(0),
        )
        .map_err(FeedError::Store)?;
        Ok(n != 0)
    }

    /// Min/max aggregate over OpenTime; `None` when the table is empty.
    pub fn min_max_open_time(&self) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock();
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            &format!("SELECT MIN(OpenTime), MAX(OpenTime) FROM `{}`", self.table),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(FeedError::Store)?;
        Ok(min.zip(max))
    }

    pub fn max_open_time(&self) -> Result<Option<i64>> {
        Ok(self.min_max_open_time()?.map(|(_, max)| max))
    }

    /// All persisted OpenTime keys in ascending order.
    pub fn open_times(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT OpenTime FROM `{}` ORDER BY OpenTime ASC",
                self.table
            ))
            .map_err(FeedError::Store)?;
        let times = stmt
            .query_map([], |row| row.get(0))
            .map_err(FeedError::Store)?
            .collect::<std::result::Result<Vec<i64>, _>>()
            .map_err(FeedError::Store)?;
        Ok(times)
    }

    /// Range scan `[since, until]` inclusive, ascending.
    pub fn fetch_range(&self, since: i64, until: i64) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT OpenTime, Open, High, Low, Close, Volume FROM `{}`
                 WHERE OpenTime >= ?1 AND OpenTime <= ?2 ORDER BY OpenTime ASC",
                self.table
            ))
            .map_err(FeedError::Store)?;
        let rows = stmt
            .query_map(params![since, until], |row| {
                Ok(Candle {
                    open_time: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            })
            .map_err(FeedError::Store)?
            .collect::<std::result::Result<Vec<Candle>, _>>()
            .map_err(FeedError::Store)?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM `{}`", self.table), [], |row| {
                row.get(0)
            })
            .map_err(FeedError::Store)?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_series() -> Series {
        Series::new("BTC-USDT-SWAP", "1m".parse().unwrap())
    }

    fn candle(t: i64, close: f64) -> Candle {
        Candle::new(t, close, close + 1.0, close - 1.0, close, 100.0)
    }

    #[test]
    fn insert_and_scan_roundtrip() {
        let store = CandleStore::in_memory(&test_series()).unwrap();
        store
            .insert_batch(&[candle(0, 1.0), candle(60_000, 2.0), candle(120_000, 3.0)])
            .unwrap();

        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.min_max_open_time().unwrap(), Some((0, 120_000)));

        let rows = store.fetch_range(60_000, 120_000).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].open_time, 60_000);
    }

    #[test]
    fn empty_table_has_no_min_max() {
        let store = CandleStore::in_memory(&test_series()).unwrap();
        assert_eq!(store.min_max_open_time().unwrap(), None);
        assert_eq!(store.max_open_time().unwrap(), None);
        assert_eq!(store.open_times().unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn update_and_delete_by_open_time() {
        let store = CandleStore::in_memory(&test_series()).unwrap();
        store.insert(&candle(60_000, 2.0)).unwrap();

        let touched = store.update_at(&candle(60_000, 9.0)).unwrap();
        assert!(touched);
        let rows = store.fetch_range(0, 120_000).unwrap();
        assert!((rows[0].close - 9.0).abs() < f64::EPSILON);

        assert!(!store.update_at(&candle(999, 1.0)).unwrap());

        assert!(store.delete_at(60_000).unwrap());
        assert!(!store.delete_at(60_000).unwrap());
        assert!(!store.exists_at(60_000).unwrap());
    }

    #[test]
    fn rusqlite_failures_surface_as_store_errors() {
        let store = CandleStore::in_memory(&test_series()).unwrap();
        store.insert(&candle(0, 1.0)).unwrap();

        // Plain insert collides on the OpenTime primary key.
        let err = store.insert(&candle(0, 2.0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FeedError>(),
            Some(FeedError::Store(_))
        ));
    }

    #[test]
    fn batch_insert_replaces_colliding_rows() {
        let store = CandleStore::in_memory(&test_series()).unwrap();
        store.insert(&candle(0, 1.0)).unwrap();
        store.insert_batch(&[candle(0, 5.0), candle(60_000, 2.0)]).unwrap();

        assert_eq!(store.count().unwrap(), 2);
        let rows = store.fetch_range(0, 0).unwrap();
        assert!((rows[0].close - 5.0).abs() < f64::EPSILON);
    }
}
