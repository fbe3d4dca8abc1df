//! SQLite result store.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("connection lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Insert results in one transaction.
    pub fn add_results(&self, results: &[ResultRecord]) -> Result<(), DbError> {
        if results.is_empty() {
            return Ok(());
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO results (time, sensor, network, step, target, ok, duration_ms, error, value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;

            for r in results {
                stmt.execute(params![
                    r.time.format(TIME_FORMAT).to_string(),
                    r.sensor,
                    r.network,
                    r.step,
                    r.target,
                    r.ok,
                    r.duration_ms,
                    r.error,
                    r.value,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Most recent results first, optionally for one network.
    pub fn get_recent_results(&self, network: Option<&str>, limit: i64) -> Result<Vec<ResultRecord>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT time, sensor, network, step, target, ok, duration_ms, error, value FROM results
             WHERE (?1 IS NULL OR network = ?1) ORDER BY time DESC, id DESC LIMIT ?2",
        )?;

        let results = stmt
            .query_map(params![network, limit], |row| {
                let time_str: String = row.get(0)?;
                Ok(ResultRecord {
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    sensor: row.get(1)?,
                    network: row.get(2)?,
                    step: row.get(3)?,
                    target: row.get(4)?,
                    ok: row.get(5)?,
                    duration_ms: row.get(6)?,
                    error: row.get(7)?,
                    value: row.get(8)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }

    /// Delete results older than `cutoff`, returning how many rows went.
    pub fn delete_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM results WHERE time < ?1",
            params![cutoff.format(TIME_FORMAT).to_string()],
        )?;
        Ok(deleted)
    }

    pub fn count_results(&self) -> Result<i64, DbError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM results", [], |r| r.get(0))?)
    }
}

fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
