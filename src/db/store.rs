//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::monitor::Reading;
use crate::settings::{KeyValueStore, SettingsError};

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
    /// Open (or create) the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Readings ---

    /// Insert readings in one transaction.
    pub fn add_readings(&self, readings: &[Reading]) -> Result<(), DbError> {
        if readings.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO readings (time, host_id, host_label, host_address, latency, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in readings {
                stmt.execute(params![
                    r.timestamp.format(TIME_FORMAT).to_string(),
                    r.host_id.to_string(),
                    r.host_label,
                    r.host_address,
                    r.latency,
                    r.status.label(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete readings older than `cutoff`, returning how many were removed.
    pub fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM readings WHERE time < ?1",
            params![cutoff.format(TIME_FORMAT).to_string()],
        )?;
        Ok(deleted)
    }

    pub fn delete_all_readings(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM readings", [])?;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn count_readings(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM readings", [], |r| r.get(0))?)
    }

    /// Oldest and newest reading times, if any readings exist.
    pub fn get_reading_time_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, DbError> {
        let conn = self.conn()?;
        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(time), MAX(time) FROM readings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let oldest = oldest.and_then(|s| parse_db_time(&s));
        let newest = newest.and_then(|s| parse_db_time(&s));
        Ok(oldest.zip(newest))
    }

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }

    // --- Settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn put_setting(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl KeyValueStore for Store {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        self.get_setting(key).map_err(|e| SettingsError::Storage(e.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.put_setting(key, value).map_err(|e| SettingsError::Storage(e.to_string()))
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
