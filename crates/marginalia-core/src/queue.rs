//! Sync queue
//!
//! Ordered, durable list of saves that still have to reach the remote. At
//! most one entry exists per document: a newer save replaces the payload of
//! the queued one in place, so the document keeps its original position.
//!
//! Every change is written through to the local store before the in-memory
//! copy is touched, so a crash never loses an intent.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::{AnnotationPayload, DocumentKey};
use crate::remote::RemoteError;
use crate::storage::{LocalStore, StorageResult};

/// Default number of non-network failures before an entry is dropped
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A pending push
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub document_key: DocumentKey,
    pub payload: AnnotationPayload,
    /// Local timestamp of the save this entry carries
    pub updated_at: DateTime<Utc>,
    /// When the document first entered the queue
    pub enqueued_at: DateTime<Utc>,
    /// Consecutive non-network push failures
    pub attempt_count: u32,
}

impl QueueEntry {
    pub fn new(document_key: DocumentKey, payload: AnnotationPayload, updated_at: DateTime<Utc>) -> Self {
        Self {
            document_key,
            payload,
            updated_at,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

/// A queued save that was abandoned after repeated failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalFailure {
    pub document_key: DocumentKey,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainResult {
    /// Entries acknowledged by the remote and removed
    pub pushed: usize,
    /// Entries dropped after exhausting their attempts
    pub dropped: Vec<TerminalFailure>,
    /// Entries that failed but stay queued for a later pass
    pub deferred: usize,
    /// The pass stopped early on a network error
    pub aborted: bool,
    pub last_error: Option<RemoteError>,
    /// Entries still queued after the pass
    pub remaining: usize,
}

impl DrainResult {
    /// Whether the queue was fully drained without a network abort
    pub fn is_complete(&self) -> bool {
        !self.aborted && self.remaining == 0
    }
}

/// FIFO of pending pushes, one per document
pub struct SyncQueue {
    store: Arc<LocalStore>,
    entries: VecDeque<QueueEntry>,
    max_attempts: u32,
}

impl SyncQueue {
    /// Load the persisted queue
    pub fn load(store: Arc<LocalStore>, max_attempts: u32) -> StorageResult<Self> {
        let entries: VecDeque<QueueEntry> = store.queue_entries()?.into();
        if !entries.is_empty() {
            info!("Loaded {} pending sync entries", entries.len());
        }
        Ok(Self {
            store,
            entries,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Queue a save, replacing the payload of an existing entry for the key
    ///
    /// A replaced entry keeps its position and starts over with zero
    /// attempts, since the payload it failed with is gone. A snapshot older
    /// than the queued one is ignored.
    pub fn enqueue(
        &mut self,
        key: &DocumentKey,
        payload: AnnotationPayload,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        if let Some(existing) = self.entries.iter_mut().find(|e| &e.document_key == key) {
            if updated_at < existing.updated_at {
                debug!("Ignoring stale save for {}, a newer one is queued", key);
                return Ok(());
            }
            let mut replaced = existing.clone();
            replaced.payload = payload;
            replaced.updated_at = updated_at;
            replaced.attempt_count = 0;
            self.store.queue_upsert(&replaced)?;
            *existing = replaced;
            debug!("Coalesced queued save for {}", key);
        } else {
            let entry = QueueEntry::new(key.clone(), payload, updated_at);
            self.store.queue_upsert(&entry)?;
            self.entries.push_back(entry);
            debug!("Queued save for {} ({} pending)", key, self.entries.len());
        }
        Ok(())
    }

    /// Remove the entry for a key, returning whether one was queued
    pub fn remove(&mut self, key: &DocumentKey) -> StorageResult<bool> {
        let removed = self.store.queue_remove(key)?;
        let before = self.entries.len();
        self.entries.retain(|e| &e.document_key != key);
        Ok(removed || self.entries.len() != before)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.entries.iter().any(|e| &e.document_key == key)
    }

    /// Entries in queue order
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Push every entry in order
    ///
    /// A network error stops the pass; the failing entry and everything
    /// behind it stay queued untouched. Any other error counts an attempt
    /// against the entry and moves on. Once an entry reaches the attempt
    /// limit it is dropped and recorded as a terminal failure.
    pub async fn drain<F, Fut>(&mut self, mut push: F) -> StorageResult<DrainResult>
    where
        F: FnMut(QueueEntry) -> Fut,
        Fut: Future<Output = Result<(), RemoteError>>,
    {
        let mut result = DrainResult::default();
        let snapshot: Vec<QueueEntry> = self.entries.iter().cloned().collect();

        for entry in snapshot {
            let key = entry.document_key.clone();
            match push(entry.clone()).await {
                Ok(()) => {
                    self.store.queue_remove(&key)?;
                    self.entries.retain(|e| e.document_key != key);
                    result.pushed += 1;
                }
                Err(e) if e.is_network() => {
                    debug!("Drain stopped at {}: {}", key, e);
                    result.aborted = true;
                    result.last_error = Some(e);
                    break;
                }
                Err(e) => {
                    let attempts = entry.attempt_count + 1;
                    if attempts >= self.max_attempts {
                        warn!("Dropping queued save for {} after {} attempts: {}", key, attempts, e);
                        let failure = TerminalFailure {
                            document_key: key.clone(),
                            reason: e.to_string(),
                            attempts,
                            failed_at: Utc::now(),
                        };
                        self.store.record_failure(&failure)?;
                        self.entries.retain(|q| q.document_key != key);
                        result.dropped.push(failure);
                    } else {
                        debug!("Push for {} failed (attempt {}): {}", key, attempts, e);
                        self.store.queue_set_attempts(&key, attempts)?;
                        if let Some(queued) = self.entries.iter_mut().find(|q| q.document_key == key) {
                            queued.attempt_count = attempts;
                        }
                        result.deferred += 1;
                    }
                    result.last_error = Some(e);
                }
            }
        }

        result.remaining = self.entries.len();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextAnnotation;

    fn payload(text: &str) -> AnnotationPayload {
        AnnotationPayload::new().with_text(TextAnnotation::new(text, 0.0, 0.0))
    }

    fn queue() -> (Arc<LocalStore>, SyncQueue) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let queue = SyncQueue::load(Arc::clone(&store), DEFAULT_MAX_ATTEMPTS).unwrap();
        (store, queue)
    }

    fn label(payload: &AnnotationPayload) -> &str {
        &payload.texts[0].text
    }

    fn keys(queue: &SyncQueue) -> Vec<String> {
        queue.entries().map(|e| e.document_key.to_string()).collect()
    }

    #[test]
    fn test_coalescing_keeps_position() {
        let (_store, mut queue) = queue();
        let a = DocumentKey::new("A");
        let b = DocumentKey::new("B");

        queue.enqueue(&a, payload("P1"), Utc::now()).unwrap();
        queue.enqueue(&b, payload("Q1"), Utc::now()).unwrap();
        queue.enqueue(&a, payload("P2"), Utc::now()).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(keys(&queue), vec!["A", "B"]);
        let first = queue.entries().next().unwrap();
        assert_eq!(label(&first.payload), "P2");
    }

    #[test]
    fn test_enqueue_resets_attempts() {
        let (store, mut queue) = queue();
        let a = DocumentKey::new("A");
        queue.enqueue(&a, payload("P1"), Utc::now()).unwrap();
        store.queue_set_attempts(&a, 3).unwrap();
        let mut queue = SyncQueue::load(Arc::clone(&store), DEFAULT_MAX_ATTEMPTS).unwrap();
        assert_eq!(queue.entries().next().unwrap().attempt_count, 3);

        queue.enqueue(&a, payload("P2"), Utc::now()).unwrap();

        assert_eq!(queue.entries().next().unwrap().attempt_count, 0);
    }

    #[test]
    fn test_older_snapshot_does_not_replace_newer() {
        let (_store, mut queue) = queue();
        let a = DocumentKey::new("A");
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::milliseconds(1);

        queue.enqueue(&a, payload("P2"), t2).unwrap();
        queue.enqueue(&a, payload("P1"), t1).unwrap();

        let entry = queue.entries().next().unwrap();
        assert_eq!(label(&entry.payload), "P2");
        assert_eq!(entry.updated_at, t2);
    }

    #[test]
    fn test_queue_survives_reload() {
        let (store, mut queue) = queue();
        queue.enqueue(&DocumentKey::new("A"), payload("P1"), Utc::now()).unwrap();
        queue.enqueue(&DocumentKey::new("B"), payload("Q1"), Utc::now()).unwrap();
        queue.enqueue(&DocumentKey::new("A"), payload("P2"), Utc::now()).unwrap();
        drop(queue);

        let reloaded = SyncQueue::load(store, DEFAULT_MAX_ATTEMPTS).unwrap();

        assert_eq!(keys(&reloaded), vec!["A", "B"]);
        assert_eq!(label(&reloaded.entries().next().unwrap().payload), "P2");
    }

    #[test]
    fn test_remove() {
        let (store, mut queue) = queue();
        let a = DocumentKey::new("A");
        queue.enqueue(&a, payload("P1"), Utc::now()).unwrap();

        assert!(queue.remove(&a).unwrap());
        assert!(!queue.remove(&a).unwrap());
        assert!(queue.is_empty());
        assert!(store.queue_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_pushes_in_order() {
        let (store, mut queue) = queue();
        queue.enqueue(&DocumentKey::new("A"), payload("P1"), Utc::now()).unwrap();
        queue.enqueue(&DocumentKey::new("B"), payload("Q1"), Utc::now()).unwrap();
        queue.enqueue(&DocumentKey::new("A"), payload("P2"), Utc::now()).unwrap();

        let mut pushed = Vec::new();
        let result = queue
            .drain(|entry| {
                pushed.push(format!("{}:{}", entry.document_key, label(&entry.payload)));
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(pushed, vec!["A:P2", "B:Q1"]);
        assert_eq!(result.pushed, 2);
        assert!(result.is_complete());
        assert!(queue.is_empty());
        assert!(store.queue_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_error_aborts_drain() {
        let (store, mut queue) = queue();
        for key in ["A", "B", "C"] {
            queue.enqueue(&DocumentKey::new(key), payload(key), Utc::now()).unwrap();
        }

        let mut outcomes = VecDeque::from([
            Ok(()),
            Err(RemoteError::Network("down".into())),
            Ok(()),
        ]);
        let mut attempted = Vec::new();
        let result = queue
            .drain(|entry| {
                attempted.push(entry.document_key.to_string());
                let outcome = outcomes.pop_front().unwrap();
                async move { outcome }
            })
            .await
            .unwrap();

        assert_eq!(attempted, vec!["A", "B"]);
        assert_eq!(result.pushed, 1);
        assert!(result.aborted);
        assert_eq!(result.remaining, 2);
        assert_eq!(keys(&queue), vec!["B", "C"]);
        assert_eq!(queue.entries().next().unwrap().attempt_count, 0);
        assert_eq!(store.queue_entries().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_failures_drop_after_limit() {
        let (store, mut queue) = queue();
        let a = DocumentKey::new("A");
        queue.enqueue(&a, payload("P1"), Utc::now()).unwrap();
        queue.enqueue(&DocumentKey::new("B"), payload("Q1"), Utc::now()).unwrap();

        let failing = |entry: QueueEntry| async move {
            if entry.document_key.as_str() == "A" {
                Err(RemoteError::Auth("refused".into()))
            } else {
                Ok(())
            }
        };

        let first = queue.drain(failing).await.unwrap();
        assert_eq!(first.pushed, 1);
        assert_eq!(first.deferred, 1);
        assert!(!first.aborted);
        assert_eq!(keys(&queue), vec!["A"]);

        for attempt in 2..DEFAULT_MAX_ATTEMPTS {
            let result = queue.drain(failing).await.unwrap();
            assert_eq!(result.deferred, 1);
            assert_eq!(queue.entries().next().unwrap().attempt_count, attempt);
        }

        let last = queue.drain(failing).await.unwrap();
        assert_eq!(last.dropped.len(), 1);
        assert_eq!(last.dropped[0].document_key, a);
        assert_eq!(last.dropped[0].attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(queue.is_empty());

        let failures = store.failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].reason.contains("refused"));
    }

    #[tokio::test]
    async fn test_rejected_entry_does_not_block_others() {
        let (_store, mut queue) = queue();
        queue.enqueue(&DocumentKey::new("A"), payload("P1"), Utc::now()).unwrap();
        queue.enqueue(&DocumentKey::new("B"), payload("Q1"), Utc::now()).unwrap();

        let result = queue
            .drain(|entry| async move {
                if entry.document_key.as_str() == "A" {
                    Err(RemoteError::Rejected("too large".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.pushed, 1);
        assert_eq!(result.deferred, 1);
        assert!(!result.is_complete());
        assert_eq!(keys(&queue), vec!["A"]);
    }
}
