//! Durable Counter Store
//!
//! Injectable get/increment counters keyed by `category:YYYY-MM-DD`.
//! The guarded-mode proposal quota goes through here so a process
//! restart cannot silently reset the day's consumption; an in-memory
//! implementation covers tests and the observer path, which has no
//! durability requirement.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::task;

/// Build the counter key for a category on a given day.
pub fn day_key(category: &str, date: NaiveDate) -> String {
    format!("{}:{}", category, date.format("%Y-%m-%d"))
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<i64>;
    /// Increment and return the new value.
    async fn increment(&self, key: &str) -> Result<i64>;
}

/// SQLite-backed counters. One row per key; increments are a single
/// UPSERT so concurrent processes cannot lose updates.
#[derive(Clone)]
pub struct SqliteCounterStore {
    db_path: PathBuf,
}

impl SqliteCounterStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path_clone)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS counters (
                    key TEXT PRIMARY KEY,
                    value INTEGER NOT NULL DEFAULT 0
                );",
                [],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn get(&self, key: &str) -> Result<i64> {
        let path = self.db_path.clone();
        let key = key.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let value: i64 = conn
                .query_row(
                    "SELECT COALESCE((SELECT value FROM counters WHERE key = ?1), 0)",
                    params![&key],
                    |row| row.get(0),
                )?;
            Ok::<_, anyhow::Error>(value)
        })
        .await?
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let path = self.db_path.clone();
        let key = key.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO counters (key, value) VALUES (?1, 1)
                 ON CONFLICT(key) DO UPDATE SET value = value + 1",
                params![&key],
            )?;
            let value: i64 = conn.query_row(
                "SELECT value FROM counters WHERE key = ?1",
                params![&key],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(value)
        })
        .await?
    }
}

/// Process-local counters for tests and the observer path.
#[derive(Default)]
pub struct MemoryCounterStore {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<i64> {
        Ok(*self.values.lock().unwrap().get(key).unwrap_or(&0))
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut values = self.values.lock().unwrap();
        let value = values.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}
