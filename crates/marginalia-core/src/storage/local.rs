//! SQLite-backed local annotation store
//!
//! Writes are committed with `synchronous = FULL` before `put` returns, so a
//! successful save survives a process restart. All access goes through one
//! connection behind a mutex: concurrent writers for the same document are
//! serialized and readers never see a half-written row.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use crate::codec;
use crate::config::Config;
use crate::models::{AnnotationPayload, AnnotationRecord, DocumentKey, RecordSyncState};
use crate::queue::{QueueEntry, TerminalFailure};

/// Counts reported by `LocalStore::stats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Documents with stored annotations
    pub records: u64,
    /// Records not yet acknowledged by the remote
    pub pending: u64,
    /// Entries waiting in the sync queue
    pub queued: u64,
    /// Documents whose last write was dropped after exhausting retries
    pub failures: u64,
    /// Size of the database file in bytes (0 for in-memory stores)
    pub database_size: u64,
}

/// Durable per-document annotation storage
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the configured database path
    pub fn open(config: &Config) -> StorageResult<Self> {
        Self::open_path(&config.database_path())
    }

    /// Open or create the database at a specific path
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;
        // journal_mode answers with the mode now in effect
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        debug!("Opened local store at {:?}", path);
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ==================== Annotation Records ====================

    /// Store a document's annotations, replacing any previous payload
    ///
    /// The record is marked `pending_push`. Its local timestamp is strictly
    /// greater than the previous one, even if the clock has not advanced.
    pub fn put(
        &self,
        key: &DocumentKey,
        payload: &AnnotationPayload,
    ) -> StorageResult<AnnotationRecord> {
        let blob = codec::encode_blob(payload).map_err(StorageError::Encode)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let previous: Option<(i64, i64, Option<i64>)> = tx
            .query_row(
                "SELECT created_at, updated_at, remote_updated_at FROM annotations WHERE document_key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let now = Utc::now().timestamp_millis();
        let (created_at, updated_at, remote_updated_at) = match previous {
            Some((created, updated, remote)) => (created, now.max(updated + 1), remote),
            None => (now, now, None),
        };

        tx.execute(
            "INSERT INTO annotations
                (document_key, annotation_blob, created_at, updated_at, remote_updated_at, sync_state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(document_key) DO UPDATE SET
                annotation_blob = excluded.annotation_blob,
                updated_at = excluded.updated_at,
                sync_state = excluded.sync_state",
            params![
                key.as_str(),
                blob,
                created_at,
                updated_at,
                remote_updated_at,
                RecordSyncState::PendingPush.as_str()
            ],
        )?;
        tx.commit()?;

        Ok(AnnotationRecord {
            document_key: key.clone(),
            payload: payload.clone(),
            created_at: from_millis("created_at", created_at)?,
            local_updated_at: from_millis("updated_at", updated_at)?,
            remote_updated_at: remote_updated_at
                .map(|ms| from_millis("remote_updated_at", ms))
                .transpose()?,
            sync_state: RecordSyncState::PendingPush,
        })
    }

    /// Read a document's annotations
    ///
    /// Returns `Ok(None)` when nothing is stored and `StorageError::Corruption`
    /// when the stored blob cannot be decoded.
    pub fn get(&self, key: &DocumentKey) -> StorageResult<Option<AnnotationRecord>> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT annotation_blob, created_at, updated_at, remote_updated_at, sync_state
                 FROM annotations WHERE document_key = ?1",
                params![key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((blob, created_at, updated_at, remote_updated_at, sync_state)) = row else {
            return Ok(None);
        };

        let payload = codec::decode_blob(&blob).map_err(|source| StorageError::Corruption {
            document_key: key.to_string(),
            source,
        })?;

        let sync_state = sync_state
            .parse::<RecordSyncState>()
            .map_err(|details| StorageError::InvalidRow {
                column: "sync_state",
                details,
            })?;

        Ok(Some(AnnotationRecord {
            document_key: key.clone(),
            payload,
            created_at: from_millis("created_at", created_at)?,
            local_updated_at: from_millis("updated_at", updated_at)?,
            remote_updated_at: remote_updated_at
                .map(|ms| from_millis("remote_updated_at", ms))
                .transpose()?,
            sync_state,
        }))
    }

    /// Delete a document's annotations and any queued push for it
    ///
    /// Returns whether a record existed.
    pub fn delete(&self, key: &DocumentKey) -> StorageResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM annotations WHERE document_key = ?1",
            params![key.as_str()],
        )?;
        tx.execute(
            "DELETE FROM sync_queue WHERE document_key = ?1",
            params![key.as_str()],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Record that the remote acknowledged a write with `remote_updated_at`
    ///
    /// The record becomes `clean` unless a newer local save landed since the
    /// pushed snapshot was taken. Any terminal failure for the key is cleared.
    pub fn mark_pushed(
        &self,
        key: &DocumentKey,
        remote_updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let remote_ms = remote_updated_at.timestamp_millis();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE annotations SET
                remote_updated_at = ?2,
                sync_state = CASE WHEN updated_at <= ?2 THEN ?3 ELSE sync_state END
             WHERE document_key = ?1",
            params![key.as_str(), remote_ms, RecordSyncState::Clean.as_str()],
        )?;
        tx.execute(
            "DELETE FROM sync_failures WHERE document_key = ?1",
            params![key.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Flag a record as needing another push, returning whether it exists
    pub fn mark_pending(&self, key: &DocumentKey) -> StorageResult<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE annotations SET sync_state = ?2 WHERE document_key = ?1",
            params![key.as_str(), RecordSyncState::PendingPush.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Keys of records not yet acknowledged by the remote, oldest save first
    pub fn pending_keys(&self) -> StorageResult<Vec<DocumentKey>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT document_key FROM annotations WHERE sync_state = ?1 ORDER BY updated_at",
        )?;
        let keys = stmt
            .query_map(params![RecordSyncState::PendingPush.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys.into_iter().map(DocumentKey::new).collect())
    }

    pub fn stats(&self) -> StorageResult<StorageStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> StorageResult<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };

        let database_size = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StorageStats {
            records: count("SELECT COUNT(*) FROM annotations")?,
            pending: count("SELECT COUNT(*) FROM annotations WHERE sync_state = 'pending_push'")?,
            queued: count("SELECT COUNT(*) FROM sync_queue")?,
            failures: count("SELECT COUNT(*) FROM sync_failures")?,
            database_size,
        })
    }

    // ==================== Sync Queue Persistence ====================

    /// Insert a queue entry, or replace the payload of the existing entry
    ///
    /// Replacing keeps the entry's position and resets its attempt count.
    pub fn queue_upsert(&self, entry: &QueueEntry) -> StorageResult<()> {
        let blob = codec::encode_blob(&entry.payload).map_err(StorageError::Encode)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_queue (document_key, payload_blob, updated_at, enqueued_at, attempt_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(document_key) DO UPDATE SET
                payload_blob = excluded.payload_blob,
                updated_at = excluded.updated_at,
                attempt_count = excluded.attempt_count",
            params![
                entry.document_key.as_str(),
                blob,
                entry.updated_at.timestamp_millis(),
                entry.enqueued_at.timestamp_millis(),
                entry.attempt_count,
            ],
        )?;
        Ok(())
    }

    /// All queue entries in queue order
    ///
    /// Entries whose payload cannot be decoded are removed and skipped; the
    /// record they were copied from is still `pending_push` and can be
    /// re-enqueued from there.
    pub fn queue_entries(&self) -> StorageResult<Vec<QueueEntry>> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT document_key, payload_blob, updated_at, enqueued_at, attempt_count
                 FROM sync_queue ORDER BY position",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, u32>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (key, blob, updated_at, enqueued_at, attempt_count) in rows {
            let document_key = DocumentKey::new(key);
            match codec::decode_blob(&blob) {
                Ok(payload) => entries.push(QueueEntry {
                    document_key,
                    payload,
                    updated_at: from_millis("updated_at", updated_at)?,
                    enqueued_at: from_millis("enqueued_at", enqueued_at)?,
                    attempt_count,
                }),
                Err(e) => {
                    warn!("Discarding corrupted queue entry for {}: {}", document_key, e);
                    self.queue_remove(&document_key)?;
                }
            }
        }
        Ok(entries)
    }

    /// Remove the queue entry for a key, returning whether one existed
    pub fn queue_remove(&self, key: &DocumentKey) -> StorageResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM sync_queue WHERE document_key = ?1",
            params![key.as_str()],
        )?;
        Ok(removed > 0)
    }

    pub fn queue_set_attempts(&self, key: &DocumentKey, attempts: u32) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_queue SET attempt_count = ?2 WHERE document_key = ?1",
            params![key.as_str(), attempts],
        )?;
        Ok(())
    }

    // ==================== Terminal Failures ====================

    /// Drop a queue entry and record its terminal failure in one transaction
    pub fn record_failure(&self, failure: &TerminalFailure) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM sync_queue WHERE document_key = ?1",
            params![failure.document_key.as_str()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO sync_failures (document_key, reason, attempts, failed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                failure.document_key.as_str(),
                failure.reason,
                failure.attempts,
                failure.failed_at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Terminal failures, most recent first
    pub fn failures(&self) -> StorageResult<Vec<TerminalFailure>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT document_key, reason, attempts, failed_at FROM sync_failures
             ORDER BY failed_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, reason, attempts, failed_at)| {
                Ok(TerminalFailure {
                    document_key: DocumentKey::new(key),
                    reason,
                    attempts,
                    failed_at: from_millis("failed_at", failed_at)?,
                })
            })
            .collect()
    }

    /// Forget the terminal failure for one key, returning whether it existed
    pub fn clear_failure(&self, key: &DocumentKey) -> StorageResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM sync_failures WHERE document_key = ?1",
            params![key.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Forget all terminal failures, returning how many were removed
    pub fn clear_failures(&self) -> StorageResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM sync_failures", [])?)
    }
}

fn from_millis(column: &'static str, ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StorageError::InvalidRow {
        column,
        details: format!("timestamp {} out of range", ms),
    })
}
