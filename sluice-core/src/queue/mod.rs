//! Durable event queue
//!
//! Local, persistent store of undelivered events with retry bookkeeping,
//! bounded capacity, and oldest-first eviction. The storage layer mirrors a
//! small repository pattern: schema migrations in [`schema`], the SQLite
//! store in [`store`].
//!
//! Everything except `init` fails open: readers return empty/zero results
//! and writers log a warning, so delivery degrades instead of erroring into
//! application code.

pub mod schema;
pub mod store;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AnalyticsEvent, StoredEvent};

pub use store::SqliteEventQueue;

/// Default page size for pending reads.
pub const DEFAULT_PENDING_LIMIT: usize = 50;

/// Maximum events retained before oldest-first eviction.
pub const DEFAULT_MAX_EVENTS: usize = 1000;

/// Narrow interface over the host's durable storage capability.
///
/// A non-browser host backs this with an embedded on-disk store; tests use
/// an in-memory database. Callers never mutate a `StoredEvent` directly —
/// mutation is only via `increment_retry`, deletion via
/// `remove_event`/`cleanup`.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Establish the store and its schema. Idempotent; safe to call
    /// repeatedly. The only queue operation allowed to fail loudly
    /// (`Error::StorageUnavailable`).
    async fn init(&self) -> Result<()>;

    /// Persist an event with a fresh id, current timestamp, and
    /// `retry_count = 0`, evicting oldest entries beyond capacity.
    /// Never errors; storage failures are logged.
    async fn store_event(&self, event: &AnalyticsEvent);

    /// Up to `limit` events within the retry budget, oldest first.
    /// Empty on storage error.
    async fn pending_events(&self, limit: usize) -> Vec<StoredEvent>;

    /// Total number of stored events, unfiltered by retry budget.
    /// Zero on storage error.
    async fn pending_count(&self) -> usize;

    /// Delete by id; unknown ids are a silent no-op.
    async fn remove_event(&self, id: &str);

    /// Bump `retry_count` and stamp `last_retry`; unknown ids are a
    /// silent no-op.
    async fn increment_retry(&self, id: &str);

    /// Hard-delete every event whose `retry_count` exceeds the budget.
    async fn cleanup(&self);
}
