//! SQLite-backed durable event queue

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{AnalyticsEvent, RetryConfig, StoredEvent};

use super::{DurableQueue, DEFAULT_MAX_EVENTS};

/// Durable queue backed by a local SQLite database.
///
/// A single connection behind a mutex; every operation is independently
/// transactional at the level of one stored record. The connection opens
/// lazily on first use, so construction itself never touches the disk.
pub struct SqliteEventQueue {
    /// Database file path; `None` for an in-memory store (tests)
    path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
    max_events: usize,
    retry_config: Arc<RwLock<RetryConfig>>,
}

impl SqliteEventQueue {
    /// Create a file-backed queue. The store is established on `init` (or
    /// lazily on first operation).
    pub fn new(path: PathBuf, retry_config: Arc<RwLock<RetryConfig>>) -> Self {
        Self {
            path: Some(path),
            conn: Mutex::new(None),
            max_events: DEFAULT_MAX_EVENTS,
            retry_config,
        }
    }

    /// Create a file-backed queue with an explicit capacity.
    pub fn with_capacity(
        path: PathBuf,
        max_events: usize,
        retry_config: Arc<RwLock<RetryConfig>>,
    ) -> Self {
        Self {
            path: Some(path),
            conn: Mutex::new(None),
            max_events,
            retry_config,
        }
    }

    /// Open an in-memory queue (for testing).
    pub fn open_in_memory(retry_config: Arc<RwLock<RetryConfig>>) -> Result<Self> {
        Self::open_in_memory_with_capacity(DEFAULT_MAX_EVENTS, retry_config)
    }

    /// Open an in-memory queue with an explicit capacity (for testing).
    pub fn open_in_memory_with_capacity(
        max_events: usize,
        retry_config: Arc<RwLock<RetryConfig>>,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(Some(conn)),
            max_events,
            retry_config,
        })
    }

    /// Open the connection and run migrations. Caller holds the lock, so
    /// concurrent initializers serialize onto the same handle.
    fn open_locked(&self, guard: &mut MutexGuard<'_, Option<Connection>>) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::StorageUnavailable("no database path configured".to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::StorageUnavailable(format!("cannot create {:?}: {}", parent, e)))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::StorageUnavailable(format!("cannot open {:?}: {}", path, e)))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )
        .map_err(|e| Error::StorageUnavailable(format!("cannot configure store: {}", e)))?;

        super::schema::run_migrations(&conn)
            .map_err(|e| Error::StorageUnavailable(format!("migration failed: {}", e)))?;

        **guard = Some(conn);
        Ok(())
    }

    /// Run an operation against the connection, failing open with `default`
    /// on any storage error.
    fn with_conn<T>(
        &self,
        op: &'static str,
        default: T,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> T {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            if let Err(e) = self.open_locked(&mut guard) {
                tracing::warn!(op, error = %e, "Durable queue unavailable");
                return default;
            }
        }
        match f(guard.as_ref().expect("connection present after open")) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(op, error = %e, "Queue operation failed");
                default
            }
        }
    }

    fn max_retries(&self) -> u32 {
        self.retry_config.read().unwrap().max_retries
    }

    fn row_to_stored(row: &Row) -> rusqlite::Result<StoredEvent> {
        let event_json: String = row.get("event")?;
        let timestamp_str: String = row.get("timestamp")?;
        let last_retry_str: Option<String> = row.get("last_retry")?;

        let event: AnalyticsEvent = serde_json::from_str(&event_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(StoredEvent {
            id: row.get("id")?,
            event,
            timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            retry_count: row.get("retry_count")?,
            last_retry: last_retry_str
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    /// Fixed-width RFC 3339 so lexicographic index order matches time order.
    fn format_ts(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

#[async_trait]
impl DurableQueue for SqliteEventQueue {
    async fn init(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        self.open_locked(&mut guard)
    }

    async fn store_event(&self, event: &AnalyticsEvent) {
        let id = Uuid::new_v4().to_string();
        let timestamp = Self::format_ts(Utc::now());
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize event for storage");
                return;
            }
        };
        let max_events = self.max_events;

        self.with_conn("store_event", (), |conn| {
            conn.execute(
                "INSERT INTO failed_events (id, event, timestamp, retry_count)
                 VALUES (?1, ?2, ?3, 0)",
                params![id, payload, timestamp],
            )?;

            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM failed_events", [], |row| row.get(0))?;
            let excess = count - max_events as i64;
            if excess > 0 {
                let evicted = conn.execute(
                    "DELETE FROM failed_events WHERE id IN (
                        SELECT id FROM failed_events ORDER BY timestamp ASC, rowid ASC LIMIT ?1
                    )",
                    params![excess],
                )?;
                tracing::warn!(evicted, max_events, "Queue over capacity, evicted oldest events");
            }
            Ok(())
        });
    }

    async fn pending_events(&self, limit: usize) -> Vec<StoredEvent> {
        let max_retries = self.max_retries();

        self.with_conn("pending_events", Vec::new(), |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event, timestamp, retry_count, last_retry
                 FROM failed_events
                 WHERE retry_count <= ?1
                 ORDER BY timestamp ASC, rowid ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![max_retries, limit as i64], Self::row_to_stored)?;
            rows.collect()
        })
    }

    async fn pending_count(&self) -> usize {
        self.with_conn("pending_count", 0, |conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM failed_events", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    async fn remove_event(&self, id: &str) {
        self.with_conn("remove_event", (), |conn| {
            // Deleting an unknown id is a no-op, not an error
            conn.execute("DELETE FROM failed_events WHERE id = ?1", params![id])?;
            Ok(())
        });
    }

    async fn increment_retry(&self, id: &str) {
        let last_retry = Self::format_ts(Utc::now());
        self.with_conn("increment_retry", (), |conn| {
            conn.execute(
                "UPDATE failed_events
                 SET retry_count = retry_count + 1, last_retry = ?2
                 WHERE id = ?1",
                params![id, last_retry],
            )?;
            Ok(())
        });
    }

    async fn cleanup(&self) {
        let max_retries = self.max_retries();
        self.with_conn("cleanup", (), |conn| {
            let removed = conn.execute(
                "DELETE FROM failed_events WHERE retry_count > ?1",
                params![max_retries],
            )?;
            if removed > 0 {
                tracing::debug!(removed, "Purged events past the retry budget");
            }
            Ok(())
        });
    }
}
