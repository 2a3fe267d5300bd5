//! Sync engine
//!
//! Orchestrates the local store, the remote store and the sync queue.
//!
//! - **save**: write locally (always), then push; a failed or skipped push
//!   leaves the save queued.
//! - **load**: wait a bounded time for the remote's current record, else
//!   answer from the local store.
//! - **sync**: drain the queue in order on a manual trigger or when
//!   connectivity returns.
//!
//! All remote pushes happen while holding the queue lock, so no two pushes
//! are ever in flight at once.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::models::{AnnotationPayload, DocumentKey};
use crate::queue::{QueueEntry, SyncQueue, TerminalFailure, DEFAULT_MAX_ATTEMPTS};
use crate::remote::{Principal, RemoteError, RemoteRecord, RemoteStore};
use crate::storage::LocalStore;
use crate::subscription::CancelHandle;

/// Aggregate sync status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No sync has run yet
    Idle,
    /// Draining the queue
    Syncing,
    /// Last sync left nothing queued
    Success,
    /// Last sync could not reach or authenticate with the remote
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Aggregate status changed
    StatusChanged(SyncStatus),
    /// Device went online (true) or offline (false)
    ConnectivityChanged(bool),
    /// A document's queued save was abandoned
    TerminalFailure(TerminalFailure),
}

/// What happened to a save after the local write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveOutcome {
    /// Acknowledged by the remote
    Pushed,
    /// Kept in the sync queue for a later drain
    Queued,
}

/// Which side answered a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    Remote,
    Local,
}

/// Result of a load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Loaded {
    pub payload: AnnotationPayload,
    pub source: LoadSource,
    /// Timestamp of the answering record
    pub updated_at: DateTime<Utc>,
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// How long a load waits for the remote before using the local copy
    pub load_timeout: Duration,
    /// Non-network push failures before a queued save is dropped
    pub max_push_attempts: u32,
    /// Delay between an online edge and the drain it triggers
    pub reconnect_settle: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_millis(3000),
            max_push_attempts: DEFAULT_MAX_ATTEMPTS,
            reconnect_settle: Duration::from_millis(2000),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            load_timeout: config.load_timeout(),
            max_push_attempts: config.max_push_attempts,
            reconnect_settle: config.reconnect_settle(),
        }
    }
}

/// Annotation sync engine
pub struct SyncEngine {
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    options: EngineOptions,
    /// Pending pushes; holding the lock serializes every push
    queue: Mutex<SyncQueue>,
    /// Cached principal, cleared on auth errors
    principal: Mutex<Option<Principal>>,
    status: watch::Sender<SyncStatus>,
    status_rx: watch::Receiver<SyncStatus>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    online: AtomicBool,
    connectivity_seen: AtomicBool,
    /// Bumped on every connectivity report; a settle timer only fires if
    /// its generation is still current
    settle_generation: AtomicU64,
    connectivity: StdMutex<Option<CancelHandle>>,
}

impl SyncEngine {
    /// Create an engine over the given stores
    ///
    /// Reloads the persisted queue and re-queues any record still waiting
    /// for a push that has no queue entry (for example after a crash between
    /// the local write and the enqueue). Documents with a terminal failure
    /// are not re-queued.
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        options: EngineOptions,
    ) -> Result<Arc<Self>, SyncError> {
        let mut queue = SyncQueue::load(Arc::clone(&local), options.max_push_attempts)?;

        let failed: HashSet<DocumentKey> = local
            .failures()?
            .into_iter()
            .map(|f| f.document_key)
            .collect();

        let mut recovered = 0;
        for key in local.pending_keys()? {
            if queue.contains(&key) || failed.contains(&key) {
                continue;
            }
            match local.get(&key) {
                Ok(Some(record)) => {
                    queue.enqueue(&key, record.payload, record.local_updated_at)?;
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) if e.is_corruption() => {
                    warn!("Cannot recover pending save for {}: {}", key, e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if recovered > 0 {
            info!("Re-queued {} unsynced saves", recovered);
        }

        let (status_tx, status_rx) = watch::channel(SyncStatus::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            local,
            remote,
            options,
            queue: Mutex::new(queue),
            principal: Mutex::new(None),
            status: status_tx,
            status_rx,
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            online: AtomicBool::new(true),
            connectivity_seen: AtomicBool::new(false),
            settle_generation: AtomicU64::new(0),
            connectivity: StdMutex::new(None),
        }))
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    // ==================== Save / Load ====================

    /// Save a document's annotations
    ///
    /// Fails only if the local write fails. Remote failures leave the save
    /// queued and show up in the sync status instead.
    pub async fn save(
        &self,
        key: &DocumentKey,
        payload: AnnotationPayload,
    ) -> Result<SaveOutcome, SyncError> {
        let mut queue = self.queue.lock().await;
        let record = self.local.put(key, &payload)?;

        if self.is_online() {
            match self.push(key, &payload, record.local_updated_at).await {
                Ok(()) => {
                    if queue.contains(key) {
                        if let Err(e) = queue.remove(key) {
                            warn!("Failed to remove stale queue entry for {}: {}", key, e);
                        }
                    }
                    debug!("Saved and pushed {}", key);
                    return Ok(SaveOutcome::Pushed);
                }
                Err(e) => warn!("Push for {} failed, queuing: {}", key, e),
            }
        } else {
            debug!("Offline, queuing save for {}", key);
        }

        // The record stays pending_push, so a failed enqueue is recovered
        // on the next start.
        if let Err(e) = queue.enqueue(key, payload, record.local_updated_at) {
            error!("Failed to queue save for {}: {}", key, e);
        }
        Ok(SaveOutcome::Queued)
    }

    /// Load a document's annotations
    ///
    /// The remote's current record wins if it arrives within the load
    /// timeout; otherwise the local copy answers. A remote answer is never
    /// written to the local store. Returns `None` when neither side has
    /// anything for the key.
    pub async fn load(&self, key: &DocumentKey) -> Result<Option<Loaded>, SyncError> {
        if self.is_online() {
            let timeout = self.options.load_timeout;
            match tokio::time::timeout(timeout, self.fetch_remote(key)).await {
                Ok(Some(record)) => match record.payload() {
                    Ok(payload) => {
                        debug!("Loaded {} from remote", key);
                        return Ok(Some(Loaded {
                            payload,
                            source: LoadSource::Remote,
                            updated_at: record.last_updated,
                        }));
                    }
                    Err(e) => {
                        warn!("Remote annotations for {} are unreadable: {}", key, e);
                    }
                },
                Ok(None) => debug!("Remote unavailable for {}, using local copy", key),
                Err(_) => debug!(
                    "No remote answer for {} within {:?}, using local copy",
                    key, timeout
                ),
            }
        }

        self.load_local(key)
    }

    /// Wait for the first remote delivery for `key`
    ///
    /// The subscription is cancelled when this returns or is dropped.
    async fn fetch_remote(&self, key: &DocumentKey) -> Option<RemoteRecord> {
        let principal = match self.principal().await {
            Ok(principal) => principal,
            Err(e) => {
                debug!("Skipping remote load for {}: {}", key, e);
                return None;
            }
        };

        let (tx, rx) = oneshot::channel::<Result<RemoteRecord, RemoteError>>();
        let slot = Arc::new(StdMutex::new(Some(tx)));
        let deliver = move |result: Result<RemoteRecord, RemoteError>| {
            let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(sender) = sender {
                let _ = sender.send(result);
            }
        };
        let on_update = deliver.clone();
        let handle = self.remote.subscribe_with_errors(
            &principal,
            key,
            Arc::new(move |record: RemoteRecord| on_update(Ok(record))),
            Arc::new(move |e: RemoteError| deliver(Err(e))),
        );

        let result = rx.await;
        handle.cancel();
        match result {
            Ok(Ok(record)) => Some(record),
            Ok(Err(e)) => {
                if e.is_auth() {
                    self.invalidate_principal().await;
                }
                debug!("Remote subscription for {} failed: {}", key, e);
                None
            }
            Err(_) => None,
        }
    }

    fn load_local(&self, key: &DocumentKey) -> Result<Option<Loaded>, SyncError> {
        match self.local.get(key) {
            Ok(Some(record)) => Ok(Some(Loaded {
                payload: record.payload,
                source: LoadSource::Local,
                updated_at: record.local_updated_at,
            })),
            Ok(None) => Ok(None),
            Err(e) if e.is_corruption() => {
                warn!("Treating corrupted annotations for {} as absent: {}", key, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a document's annotations locally, with any queued push
    ///
    /// The remote copy is left alone.
    pub async fn delete(&self, key: &DocumentKey) -> Result<bool, SyncError> {
        let mut queue = self.queue.lock().await;
        queue.remove(key)?;
        Ok(self.local.delete(key)?)
    }

    // ==================== Sync ====================

    /// Drain the sync queue now
    pub async fn sync_now(&self) -> SyncStatus {
        let mut queue = self.queue.lock().await;
        self.set_status(SyncStatus::Syncing);
        info!("Starting sync, {} pending", queue.len());

        if let Err(e) = self.principal().await {
            warn!("Sync could not authenticate: {}", e);
            self.set_status(SyncStatus::Error);
            return SyncStatus::Error;
        }

        let drained = queue
            .drain(move |entry: QueueEntry| async move {
                self.push(&entry.document_key, &entry.payload, entry.updated_at)
                    .await
            })
            .await;

        let result = match drained {
            Ok(result) => result,
            Err(e) => {
                error!("Sync queue could not be updated: {}", e);
                self.set_status(SyncStatus::Error);
                return SyncStatus::Error;
            }
        };

        for failure in &result.dropped {
            error!(
                "Giving up on {} after {} attempts: {}",
                failure.document_key, failure.attempts, failure.reason
            );
            self.emit(SyncEvent::TerminalFailure(failure.clone()));
        }

        let status = if result.is_complete() {
            info!("Sync complete, {} pushed", result.pushed);
            SyncStatus::Success
        } else {
            match &result.last_error {
                Some(e) => warn!(
                    "Sync incomplete, {} pushed, {} remaining: {}",
                    result.pushed, result.remaining, e
                ),
                None => warn!("Sync incomplete, {} remaining", result.remaining),
            }
            SyncStatus::Error
        };
        self.set_status(status);
        status
    }

    /// Push one record, authenticating first if needed
    async fn push(
        &self,
        key: &DocumentKey,
        payload: &AnnotationPayload,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RemoteError> {
        let principal = self.principal().await?;
        let record = RemoteRecord::from_payload(payload, updated_at)
            .map_err(|e| RemoteError::Rejected(format!("payload could not be encoded: {}", e)))?;

        let ack = match self.remote.push(&principal, key, &record).await {
            Ok(ack) => ack,
            Err(e) => {
                if e.is_auth() {
                    self.invalidate_principal().await;
                }
                return Err(e);
            }
        };

        if !ack.applied {
            info!(
                "Remote holds a newer record for {} ({}), keeping it",
                key, ack.last_updated
            );
        }
        if let Err(e) = self.local.mark_pushed(key, ack.last_updated) {
            warn!("Failed to record push for {}: {}", key, e);
        }
        Ok(())
    }

    async fn principal(&self) -> Result<Principal, RemoteError> {
        let mut cached = self.principal.lock().await;
        if let Some(principal) = cached.as_ref() {
            return Ok(principal.clone());
        }
        match self.remote.authenticate().await {
            Ok(principal) => {
                debug!("Authenticated as {}", principal.id);
                *cached = Some(principal.clone());
                Ok(principal)
            }
            Err(e) => Err(e),
        }
    }

    async fn invalidate_principal(&self) {
        if self.principal.lock().await.take().is_some() {
            debug!("Cleared cached principal after auth error");
        }
    }

    // ==================== Connectivity ====================

    /// Follow a connectivity monitor
    ///
    /// Going offline stops push attempts. Coming online (or starting online)
    /// drains the queue once the settle delay has passed, if the device is
    /// still online and there is something to do.
    pub fn attach_connectivity(self: &Arc<Self>, monitor: &ConnectivityMonitor) {
        let weak = Arc::downgrade(self);
        let handle = monitor.subscribe(move |online| {
            if let Some(engine) = weak.upgrade() {
                engine.on_connectivity(online);
            }
        });

        let previous = self
            .connectivity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        drop(previous);
    }

    fn on_connectivity(self: &Arc<Self>, online: bool) {
        let first = !self.connectivity_seen.swap(true, Ordering::SeqCst);
        let was_online = self.online.swap(online, Ordering::SeqCst);
        let generation = self.settle_generation.fetch_add(1, Ordering::SeqCst) + 1;

        if was_online != online {
            self.emit(SyncEvent::ConnectivityChanged(online));
        }
        if !online || (was_online && !first) {
            return;
        }

        let weak = Arc::downgrade(self);
        let settle = self.options.reconnect_settle;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(engine) = weak.upgrade() else {
                return;
            };
            if engine.settle_generation.load(Ordering::SeqCst) != generation
                || !engine.is_online()
            {
                debug!("Connectivity changed during settle delay, skipping drain");
                return;
            }
            if engine.pending_count().await > 0 || engine.status() == SyncStatus::Error {
                engine.sync_now().await;
            }
        });
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Stop following connectivity and discard any pending settle timer
    pub fn shutdown(&self) {
        self.settle_generation.fetch_add(1, Ordering::SeqCst);
        let handle = self
            .connectivity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.cancel();
            debug!("Detached from connectivity monitor");
        }
    }

    // ==================== Observability ====================

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Snapshot of the queue, in drain order
    pub async fn pending(&self) -> Vec<QueueEntry> {
        self.queue.lock().await.entries().cloned().collect()
    }

    /// Documents whose saves were abandoned, most recent first
    pub fn terminal_failures(&self) -> Result<Vec<TerminalFailure>, SyncError> {
        Ok(self.local.failures()?)
    }

    pub fn clear_failures(&self) -> Result<usize, SyncError> {
        Ok(self.local.clear_failures()?)
    }

    /// Queue an abandoned document again from its local copy
    ///
    /// Returns false if the key had no terminal failure.
    pub async fn retry_failed(&self, key: &DocumentKey) -> Result<bool, SyncError> {
        let mut queue = self.queue.lock().await;
        if !self.local.clear_failure(key)? {
            return Ok(false);
        }
        match self.local.get(key)? {
            Some(record) => {
                self.local.mark_pending(key)?;
                queue.enqueue(key, record.payload, record.local_updated_at)?;
                info!("Re-queued {} after terminal failure", key);
            }
            None => debug!("No local annotations left for {}", key),
        }
        Ok(true)
    }

    fn set_status(&self, status: SyncStatus) {
        let _ = self.status.send(status);
        self.emit(SyncEvent::StatusChanged(status));
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordSyncState, TextAnnotation};
    use crate::remote::MemoryRemoteStore;
    use tempfile::TempDir;

    fn payload(text: &str) -> AnnotationPayload {
        AnnotationPayload::new().with_text(TextAnnotation::new(text, 10.0, 20.0))
    }

    fn label(payload: &AnnotationPayload) -> &str {
        &payload.texts[0].text
    }

    fn engine_with(remote: &MemoryRemoteStore) -> (Arc<LocalStore>, Arc<SyncEngine>) {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let engine = SyncEngine::new(
            Arc::clone(&local),
            Arc::new(remote.clone()),
            EngineOptions::default(),
        )
        .unwrap();
        (local, engine)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_save_pushes_when_online() {
        let remote = MemoryRemoteStore::new("u1");
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("file:///docs/a.pdf");

        let outcome = engine.save(&key, payload("hello")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Pushed);
        let stored = remote.record("u1", &key).unwrap();
        assert_eq!(label(&stored.payload().unwrap()), "hello");

        let record = local.get(&key).unwrap().unwrap();
        assert_eq!(record.sync_state, RecordSyncState::Clean);
        assert_eq!(record.remote_updated_at, Some(record.local_updated_at));
        assert_eq!(stored.last_updated, record.local_updated_at);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_save_queues_when_remote_unreachable() {
        let remote = MemoryRemoteStore::new("u1");
        remote.set_offline(true);
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");

        let outcome = engine.save(&key, payload("offline")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Queued);
        assert_eq!(engine.pending_count().await, 1);
        assert_eq!(label(&local.get(&key).unwrap().unwrap().payload), "offline");
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_save_skips_push_when_known_offline() {
        let remote = MemoryRemoteStore::new("u1");
        let (_local, engine) = engine_with(&remote);
        let monitor = ConnectivityMonitor::new(false);
        engine.attach_connectivity(&monitor);
        settle().await;
        assert!(!engine.is_online());

        let outcome = engine.save(&DocumentKey::new("doc-a"), payload("x")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Queued);
        assert_eq!(remote.auth_calls(), 0);
        assert!(remote.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_successful_push_removes_stale_queue_entry() {
        let remote = MemoryRemoteStore::new("u1");
        let (_local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");

        remote.set_offline(true);
        engine.save(&key, payload("v1")).await.unwrap();
        assert_eq!(engine.pending_count().await, 1);

        remote.set_offline(false);
        let outcome = engine.save(&key, payload("v2")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Pushed);
        assert_eq!(engine.pending_count().await, 0);
        assert_eq!(remote.pushes().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_queue_the_latest_snapshot() {
        let remote = MemoryRemoteStore::new("u1");
        remote.set_offline(true);
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");

        let saves: Vec<_> = (0..16)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let key = key.clone();
                tokio::spawn(async move { engine.save(&key, payload(&format!("v{}", i))).await })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        let record = local.get(&key).unwrap().unwrap();
        let queued = engine.pending().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].updated_at, record.local_updated_at);
        assert_eq!(label(&queued[0].payload), label(&record.payload));

        remote.set_offline(false);
        assert_eq!(engine.sync_now().await, SyncStatus::Success);
        let record = local.get(&key).unwrap().unwrap();
        assert_eq!(record.sync_state, RecordSyncState::Clean);
        let stored = remote.record("u1", &key).unwrap();
        assert_eq!(label(&stored.payload().unwrap()), label(&record.payload));
    }

    #[tokio::test]
    async fn test_sync_now_drains_in_order() {
        let remote = MemoryRemoteStore::new("u1");
        let (local, engine) = engine_with(&remote);
        let mut events = engine.take_events().unwrap();
        let (a, b) = (DocumentKey::new("A"), DocumentKey::new("B"));

        remote.set_offline(true);
        engine.save(&a, payload("P1")).await.unwrap();
        engine.save(&b, payload("Q1")).await.unwrap();
        engine.save(&a, payload("P2")).await.unwrap();
        remote.set_offline(false);

        let status = engine.sync_now().await;

        assert_eq!(status, SyncStatus::Success);
        assert_eq!(engine.status(), SyncStatus::Success);
        let pushed: Vec<_> = remote
            .pushes()
            .iter()
            .map(|(key, record)| format!("{}:{}", key, label(&record.payload().unwrap())))
            .collect();
        assert_eq!(pushed, vec!["A:P2", "B:Q1"]);
        assert_eq!(local.get(&a).unwrap().unwrap().sync_state, RecordSyncState::Clean);
        assert_eq!(engine.pending_count().await, 0);

        let events = drain_events(&mut events);
        assert_eq!(
            events,
            vec![
                SyncEvent::StatusChanged(SyncStatus::Syncing),
                SyncEvent::StatusChanged(SyncStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_sync_now_reports_error_when_offline() {
        let remote = MemoryRemoteStore::new("u1");
        remote.set_offline(true);
        let (_local, engine) = engine_with(&remote);
        engine.save(&DocumentKey::new("A"), payload("P1")).await.unwrap();

        assert_eq!(engine.sync_now().await, SyncStatus::Error);
        assert_eq!(engine.pending_count().await, 1);

        remote.set_offline(false);
        assert_eq!(engine.sync_now().await, SyncStatus::Success);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_network_error_mid_drain_keeps_rest_queued() {
        let remote = MemoryRemoteStore::new("u1");
        remote.set_offline(true);
        let (_local, engine) = engine_with(&remote);
        for key in ["A", "B", "C"] {
            engine.save(&DocumentKey::new(key), payload(key)).await.unwrap();
        }
        remote.set_offline(false);
        let b = DocumentKey::new("B");
        remote.reject_key(&b, RemoteError::Network("dropped".into()));

        assert_eq!(engine.sync_now().await, SyncStatus::Error);
        let remaining: Vec<_> = engine
            .pending()
            .await
            .into_iter()
            .map(|e| (e.document_key.to_string(), e.attempt_count))
            .collect();
        assert_eq!(remaining, vec![("B".to_string(), 0), ("C".to_string(), 0)]);
        assert_eq!(remote.pushes().len(), 1);

        remote.clear_rejection(&b);
        assert_eq!(engine.sync_now().await, SyncStatus::Success);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_auth_rejection_drops_after_limit() {
        let remote = MemoryRemoteStore::new("u1");
        let (local, engine) = engine_with(&remote);
        let mut events = engine.take_events().unwrap();
        let key = DocumentKey::new("doc-a");
        remote.reject_key(&key, RemoteError::Auth("revoked".into()));

        assert_eq!(engine.save(&key, payload("x")).await.unwrap(), SaveOutcome::Queued);
        assert_eq!(remote.auth_calls(), 1);

        for attempt in 1..DEFAULT_MAX_ATTEMPTS {
            assert_eq!(engine.sync_now().await, SyncStatus::Error);
            assert_eq!(engine.pending().await[0].attempt_count, attempt);
        }
        // Every auth error clears the cached principal
        assert_eq!(remote.auth_calls(), DEFAULT_MAX_ATTEMPTS as usize);

        assert_eq!(engine.sync_now().await, SyncStatus::Success);
        assert_eq!(engine.pending_count().await, 0);

        let failures = engine.terminal_failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].document_key, key);
        assert_eq!(failures[0].attempts, DEFAULT_MAX_ATTEMPTS);

        let terminal: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SyncEvent::TerminalFailure(_)))
            .collect();
        assert_eq!(terminal.len(), 1);

        // Still pending locally, but not re-queued on restart
        let engine = SyncEngine::new(
            Arc::clone(&local),
            Arc::new(remote.clone()),
            EngineOptions::default(),
        )
        .unwrap();
        assert_eq!(engine.pending_count().await, 0);

        remote.clear_rejection(&key);
        assert!(engine.retry_failed(&key).await.unwrap());
        assert_eq!(engine.pending_count().await, 1);
        assert_eq!(engine.sync_now().await, SyncStatus::Success);
        assert!(engine.terminal_failures().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saves_survive_restart() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("annotations.db");
        let remote = MemoryRemoteStore::new("u1");
        remote.set_offline(true);
        let key = DocumentKey::new("doc-a");

        {
            let local = Arc::new(LocalStore::open_path(&db).unwrap());
            let engine =
                SyncEngine::new(local, Arc::new(remote.clone()), EngineOptions::default()).unwrap();
            engine.save(&key, payload("durable")).await.unwrap();
        }

        let local = Arc::new(LocalStore::open_path(&db).unwrap());
        assert_eq!(label(&local.get(&key).unwrap().unwrap().payload), "durable");
        let engine =
            SyncEngine::new(local, Arc::new(remote.clone()), EngineOptions::default()).unwrap();
        assert_eq!(engine.pending_count().await, 1);

        remote.set_offline(false);
        assert_eq!(engine.sync_now().await, SyncStatus::Success);
        assert!(remote.record("u1", &key).is_some());
    }

    #[tokio::test]
    async fn test_startup_requeues_unqueued_pending_records() {
        let local = Arc::new(LocalStore::open_in_memory().unwrap());
        let key = DocumentKey::new("doc-a");
        local.put(&key, &payload("written before crash")).unwrap();

        let remote = MemoryRemoteStore::new("u1");
        let engine =
            SyncEngine::new(Arc::clone(&local), Arc::new(remote), EngineOptions::default()).unwrap();

        let pending = engine.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(label(&pending[0].payload), "written before crash");
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_prefers_remote_within_timeout() {
        let remote = MemoryRemoteStore::new("u1");
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");
        local.put(&key, &payload("local")).unwrap();
        remote.write_from_other_device(
            &key,
            RemoteRecord::from_payload(&payload("remote"), Utc::now()).unwrap(),
        );
        remote.set_initial_delivery_delay(Some(Duration::from_millis(500)));

        let start = tokio::time::Instant::now();
        let loaded = engine.load(&key).await.unwrap().unwrap();

        assert_eq!(loaded.source, LoadSource::Remote);
        assert_eq!(label(&loaded.payload), "remote");
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(3000));
        assert_eq!(remote.listener_count(), 0);
        // A remote answer does not overwrite the local copy
        assert_eq!(label(&local.get(&key).unwrap().unwrap().payload), "local");
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_falls_back_to_local_after_timeout() {
        let remote = MemoryRemoteStore::new("u1");
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");
        local.put(&key, &payload("local")).unwrap();

        let start = tokio::time::Instant::now();
        let loaded = engine.load(&key).await.unwrap().unwrap();

        assert_eq!(loaded.source, LoadSource::Local);
        assert_eq!(label(&loaded.payload), "local");
        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert_eq!(remote.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_remote_answer_is_discarded() {
        let remote = MemoryRemoteStore::new("u1");
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");
        remote.write_from_other_device(
            &key,
            RemoteRecord::from_payload(&payload("remote"), Utc::now()).unwrap(),
        );
        remote.set_initial_delivery_delay(Some(Duration::from_millis(5000)));

        assert!(engine.load(&key).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(local.get(&key).unwrap().is_none());
        assert_eq!(remote.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_load_falls_back_and_reauthenticates() {
        let remote = MemoryRemoteStore::new("u1");
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");
        engine.save(&key, payload("mine")).await.unwrap();
        assert_eq!(remote.auth_calls(), 1);

        remote.set_auth_failure(Some("token expired"));
        let start = tokio::time::Instant::now();
        let loaded = engine.load(&key).await.unwrap().unwrap();

        assert_eq!(loaded.source, LoadSource::Local);
        assert!(start.elapsed() < Duration::from_millis(3000));
        assert_eq!(remote.listener_count(), 0);

        remote.set_auth_failure(None);
        let loaded = engine.load(&key).await.unwrap().unwrap();

        assert_eq!(loaded.source, LoadSource::Remote);
        assert_eq!(label(&loaded.payload), "mine");
        assert_eq!(remote.auth_calls(), 2);
        assert_eq!(label(&local.get(&key).unwrap().unwrap().payload), "mine");
    }

    #[tokio::test]
    async fn test_load_missing_everywhere_when_remote_unreachable() {
        let remote = MemoryRemoteStore::new("u1");
        remote.set_offline(true);
        let (_local, engine) = engine_with(&remote);

        assert!(engine.load(&DocumentKey::new("nothing")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_edge_drains_after_settle_delay() {
        let remote = MemoryRemoteStore::new("u1");
        let (_local, engine) = engine_with(&remote);
        let monitor = ConnectivityMonitor::new(false);
        engine.attach_connectivity(&monitor);
        settle().await;

        engine.save(&DocumentKey::new("A"), payload("P1")).await.unwrap();
        assert_eq!(engine.pending_count().await, 1);

        monitor.report(true);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(engine.is_online());
        assert!(remote.pushes().is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(remote.pushes().len(), 1);
        assert_eq!(engine.status(), SyncStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_offline_during_settle_skips_drain() {
        let remote = MemoryRemoteStore::new("u1");
        let (_local, engine) = engine_with(&remote);
        let mut events = engine.take_events().unwrap();
        let monitor = ConnectivityMonitor::new(false);
        engine.attach_connectivity(&monitor);
        settle().await;
        engine.save(&DocumentKey::new("A"), payload("P1")).await.unwrap();

        monitor.report(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.report(false);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(remote.pushes().is_empty());
        assert_eq!(engine.status(), SyncStatus::Idle);
        assert_eq!(
            drain_events(&mut events),
            vec![
                SyncEvent::ConnectivityChanged(false),
                SyncEvent::ConnectivityChanged(true),
                SyncEvent::ConnectivityChanged(false),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_detaches_from_monitor() {
        let remote = MemoryRemoteStore::new("u1");
        let (_local, engine) = engine_with(&remote);
        let monitor = ConnectivityMonitor::new(true);
        engine.attach_connectivity(&monitor);
        settle().await;

        engine.shutdown();
        monitor.report(false);
        settle().await;

        assert!(engine.is_online());
    }

    #[tokio::test]
    async fn test_status_watch_sees_transitions() {
        let remote = MemoryRemoteStore::new("u1");
        let (_local, engine) = engine_with(&remote);
        let mut status = engine.subscribe_status();
        assert_eq!(*status.borrow(), SyncStatus::Idle);

        engine.sync_now().await;

        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), SyncStatus::Success);
    }

    #[tokio::test]
    async fn test_delete_removes_local_and_queued() {
        let remote = MemoryRemoteStore::new("u1");
        remote.set_offline(true);
        let (local, engine) = engine_with(&remote);
        let key = DocumentKey::new("doc-a");
        engine.save(&key, payload("x")).await.unwrap();

        assert!(engine.delete(&key).await.unwrap());
        assert!(!engine.delete(&key).await.unwrap());
        assert!(local.get(&key).unwrap().is_none());
        assert_eq!(engine.pending_count().await, 0);
    }
}
