//! Queue schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: failed-event store with lookup indices
    r#"
    CREATE TABLE IF NOT EXISTS failed_events (
        id          TEXT PRIMARY KEY,
        event       JSON NOT NULL,
        timestamp   TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_retry  TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_failed_events_timestamp
        ON failed_events(timestamp);

    CREATE INDEX IF NOT EXISTS idx_failed_events_retry_count
        ON failed_events(retry_count);
    "#,
];

/// Run any pending migrations on the given connection
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = idx as i32 + 1;
        if version > current {
            tracing::info!(version, "Applying queue schema migration");
            conn.execute_batch(migration)?;
            conn.pragma_update(None, "user_version", version)?;
        }
    }

    Ok(())
}
