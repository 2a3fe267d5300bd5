//! SQLite schema for the local annotation store
//!
//! One row per document in `annotations`, durable queue entries in
//! `sync_queue` and per-document terminal sync failures in `sync_failures`.
//! Timestamps are stored as milliseconds since the Unix epoch.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Annotation records, one per document
        CREATE TABLE IF NOT EXISTS annotations (
            document_key TEXT PRIMARY KEY,
            annotation_blob BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            remote_updated_at INTEGER,
            sync_state TEXT NOT NULL DEFAULT 'clean'
        );

        -- Pending pushes; position keeps first-insertion order per key
        CREATE TABLE IF NOT EXISTS sync_queue (
            position INTEGER PRIMARY KEY AUTOINCREMENT,
            document_key TEXT NOT NULL UNIQUE,
            payload_blob BLOB NOT NULL,
            updated_at INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0
        );

        -- Writes dropped after exhausting their retry budget
        CREATE TABLE IF NOT EXISTS sync_failures (
            document_key TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            failed_at INTEGER NOT NULL
        );

        -- Indexes for common query patterns
        CREATE INDEX IF NOT EXISTS idx_annotations_updated_at ON annotations(updated_at);
        CREATE INDEX IF NOT EXISTS idx_annotations_sync_state ON annotations(sync_state);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
