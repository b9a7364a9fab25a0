use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::warn;

use shared::domain::LogEntry;

pub const LOG_JOURNAL_KEY: &str = "mqtt_logs";
pub const LOG_JOURNAL_CAP: usize = 1000;

/// Keyed string storage with last-write-wins semantics. Everything above
/// this trait is testable without a real database.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure kv_entries table exists")?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-process store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Capped, newest-first mirror of broker traffic, stored as one JSON array
/// under a single key so it survives process restarts.
pub struct LogJournal {
    store: Arc<dyn KeyValueStore>,
    key: String,
    cap: usize,
    write_guard: Mutex<()>,
}

impl LogJournal {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key_and_cap(store, LOG_JOURNAL_KEY, LOG_JOURNAL_CAP)
    }

    pub fn with_key_and_cap(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        cap: usize,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            cap,
            write_guard: Mutex::new(()),
        }
    }

    /// Prepends the entry and evicts the oldest once the cap is exceeded.
    /// The read-modify-write cycle runs under a single writer guard.
    pub async fn append(&self, entry: LogEntry) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let mut entries = self.load().await?;
        entries.insert(0, entry);
        entries.truncate(self.cap);
        let serialized = serde_json::to_string(&entries)?;
        self.store.put(&self.key, &serialized).await
    }

    /// Newest-first slice of the journal.
    pub async fn recent(&self, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let mut entries = self.load().await?;
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Newest-first entries whose topic contains `topic_filter`
    /// (case-insensitive), at most `limit` of them.
    pub async fn filtered(
        &self,
        topic_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let entries = self.load().await?;
        Ok(entries
            .into_iter()
            .filter(|entry| topic_filter.map_or(true, |needle| entry.topic_contains(needle)))
            .take(limit)
            .collect())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.load().await?.len())
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        self.store.remove(&self.key).await
    }

    async fn load(&self) -> Result<Vec<LogEntry>> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(entries),
            Err(error) => {
                warn!(key = %self.key, %error, "stored journal is not valid JSON, starting over");
                Ok(Vec::new())
            }
        }
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
