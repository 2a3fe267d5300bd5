//! In-process remote store
//!
//! Holds records in memory with the same last-write-wins and subscription
//! semantics as the server. Faults (offline, refused credentials, per-key
//! rejections, slow first delivery) can be injected to exercise the engine's
//! degraded paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    record_path, Ack, ErrorCallback, Principal, RemoteError, RemoteRecord, RemoteStore,
    UpdateCallback,
};
use crate::models::DocumentKey;
use crate::subscription::CancelHandle;

#[derive(Default)]
struct MemoryState {
    principal_id: String,
    records: HashMap<String, RemoteRecord>,
    listeners: HashMap<String, Vec<(u64, UpdateCallback)>>,
    next_listener_id: u64,
    offline: bool,
    auth_failure: Option<String>,
    rejected_keys: HashMap<DocumentKey, RemoteError>,
    scripted_failures: VecDeque<RemoteError>,
    initial_delivery_delay: Option<Duration>,
    pushes: Vec<(DocumentKey, RemoteRecord)>,
    auth_calls: usize,
}

/// Remote store kept entirely in memory
#[derive(Clone)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new("memory-user")
    }
}

impl MemoryRemoteStore {
    /// Create a store that authenticates every device as `principal_id`
    pub fn new(principal_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                principal_id: principal_id.into(),
                ..MemoryState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate losing (or regaining) the network
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Refuse authentication and pushes with an auth error
    pub fn set_auth_failure(&self, reason: Option<&str>) {
        self.lock().auth_failure = reason.map(str::to_string);
    }

    /// Fail every push for `key` with `error`
    pub fn reject_key(&self, key: &DocumentKey, error: RemoteError) {
        self.lock().rejected_keys.insert(key.clone(), error);
    }

    pub fn clear_rejection(&self, key: &DocumentKey) {
        self.lock().rejected_keys.remove(key);
    }

    /// Fail the next pushes, in order, with the given errors
    pub fn fail_next_pushes(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.lock().scripted_failures.extend(errors);
    }

    /// Delay delivery of the current value to new subscribers
    pub fn set_initial_delivery_delay(&self, delay: Option<Duration>) {
        self.lock().initial_delivery_delay = delay;
    }

    /// Successful pushes, in the order they were accepted
    pub fn pushes(&self) -> Vec<(DocumentKey, RemoteRecord)> {
        self.lock().pushes.clone()
    }

    pub fn auth_calls(&self) -> usize {
        self.lock().auth_calls
    }

    /// Number of live subscriptions across all records
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }

    pub fn record(&self, principal_id: &str, key: &DocumentKey) -> Option<RemoteRecord> {
        self.lock()
            .records
            .get(&record_path(principal_id, key))
            .cloned()
    }

    /// Write a record as another device would, notifying subscribers
    pub fn write_from_other_device(&self, key: &DocumentKey, record: RemoteRecord) {
        let path = {
            let state = self.lock();
            record_path(&state.principal_id, key)
        };
        self.apply(path, record);
    }

    /// Store the record if it wins last-write-wins, then notify listeners
    ///
    /// Re-applying the stored record is acknowledged but is not a change, so
    /// listeners are not called again.
    fn apply(&self, path: String, record: RemoteRecord) -> (bool, RemoteRecord) {
        let listeners = {
            let mut state = self.lock();
            if let Some(existing) = state.records.get(&path) {
                if *existing == record {
                    return (true, record);
                }
                if !record.supersedes(existing) {
                    return (false, existing.clone());
                }
            }
            state.records.insert(path.clone(), record.clone());
            state
                .listeners
                .get(&path)
                .map(|l| l.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>())
                .unwrap_or_default()
        };

        for listener in listeners {
            listener(record.clone());
        }
        (true, record)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn authenticate(&self) -> Result<Principal, RemoteError> {
        let mut state = self.lock();
        state.auth_calls += 1;
        if state.offline {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        if let Some(reason) = &state.auth_failure {
            return Err(RemoteError::Auth(reason.clone()));
        }
        Ok(Principal {
            id: state.principal_id.clone(),
            token: format!("memory-token-{}", state.auth_calls),
        })
    }

    async fn push(
        &self,
        principal: &Principal,
        key: &DocumentKey,
        record: &RemoteRecord,
    ) -> Result<Ack, RemoteError> {
        {
            let mut state = self.lock();
            if state.offline {
                return Err(RemoteError::Network("remote unreachable".to_string()));
            }
            if let Some(error) = state.scripted_failures.pop_front() {
                return Err(error);
            }
            if let Some(reason) = &state.auth_failure {
                return Err(RemoteError::Auth(reason.clone()));
            }
            if principal.id != state.principal_id {
                return Err(RemoteError::Auth(format!(
                    "unknown principal '{}'",
                    principal.id
                )));
            }
            if let Some(error) = state.rejected_keys.get(key) {
                return Err(error.clone());
            }
            state.pushes.push((key.clone(), record.clone()));
        }

        let (applied, stored) = self.apply(record_path(&principal.id, key), record.clone());
        debug!("Memory remote push for {} applied={}", key, applied);
        Ok(Ack {
            document_key: key.clone(),
            last_updated: stored.last_updated,
            applied,
        })
    }

    fn subscribe_with_errors(
        &self,
        principal: &Principal,
        key: &DocumentKey,
        on_update: UpdateCallback,
        on_error: ErrorCallback,
    ) -> CancelHandle {
        let path = record_path(&principal.id, key);

        let (id, current, delay) = {
            let mut state = self.lock();
            let refused = match &state.auth_failure {
                Some(reason) => Some(RemoteError::Auth(reason.clone())),
                None if principal.id != state.principal_id => Some(RemoteError::Auth(format!(
                    "unknown principal '{}'",
                    principal.id
                ))),
                None => None,
            };
            if let Some(error) = refused {
                drop(state);
                debug!("Memory remote refused subscription to {}", key);
                on_error(error);
                return CancelHandle::noop();
            }
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            (
                id,
                state.records.get(&path).cloned(),
                state.initial_delivery_delay,
            )
        };

        let weak: Weak<Mutex<MemoryState>> = Arc::downgrade(&self.state);
        let remove_path = path.clone();
        let handle = CancelHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(listeners) = state.listeners.get_mut(&remove_path) {
                    listeners.retain(|(listener_id, _)| *listener_id != id);
                    if listeners.is_empty() {
                        state.listeners.remove(&remove_path);
                    }
                }
            }
        });

        let token = handle.token();
        let gated: UpdateCallback = Arc::new(move |record: RemoteRecord| {
            if !token.is_cancelled() {
                on_update(record);
            }
        });

        self.lock()
            .listeners
            .entry(path)
            .or_default()
            .push((id, Arc::clone(&gated)));

        if let Some(record) = current {
            match delay {
                Some(delay) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        gated(record);
                    });
                }
                None => gated(record),
            }
        }

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnnotationPayload;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(offset_secs: i64) -> RemoteRecord {
        RemoteRecord::from_payload(
            &AnnotationPayload::new(),
            Utc::now() + ChronoDuration::seconds(offset_secs),
        )
        .unwrap()
    }

    fn counter_callback() -> (Arc<AtomicUsize>, UpdateCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Arc::new(move |_: RemoteRecord| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_push_and_read_back() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");
        let rec = record(0);

        let ack = remote.push(&principal, &key, &rec).await.unwrap();

        assert!(ack.applied);
        assert_eq!(ack.last_updated, rec.last_updated);
        assert_eq!(remote.record("u1", &key), Some(rec));
        assert_eq!(remote.pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_older_push_is_not_applied() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");
        let newer = record(10);

        remote.write_from_other_device(&key, newer.clone());
        let ack = remote.push(&principal, &key, &record(0)).await.unwrap();

        assert!(!ack.applied);
        assert_eq!(ack.last_updated, newer.last_updated);
        assert_eq!(remote.record("u1", &key), Some(newer));
    }

    #[tokio::test]
    async fn test_repeated_identical_push_is_harmless() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");
        let rec = record(0);

        remote.push(&principal, &key, &rec).await.unwrap();
        let ack = remote.push(&principal, &key, &rec).await.unwrap();

        assert!(ack.applied);
        assert_eq!(remote.record("u1", &key), Some(rec));
    }

    #[tokio::test]
    async fn test_identical_push_does_not_notify_again() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");
        let rec = record(0);
        remote.push(&principal, &key, &rec).await.unwrap();

        let (count, callback) = counter_callback();
        let _handle = remote.subscribe(&principal, &key, callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let ack = remote.push(&principal, &key, &rec).await.unwrap();
        assert!(ack.applied);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        remote.push(&principal, &key, &record(5)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offline_and_auth_faults() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");

        remote.set_offline(true);
        assert!(remote.authenticate().await.unwrap_err().is_network());
        assert!(remote.push(&principal, &key, &record(0)).await.unwrap_err().is_network());

        remote.set_offline(false);
        remote.set_auth_failure(Some("token expired"));
        assert!(remote.push(&principal, &key, &record(0)).await.unwrap_err().is_auth());

        remote.set_auth_failure(None);
        remote.fail_next_pushes([RemoteError::Rejected("quota".into())]);
        assert_eq!(
            remote.push(&principal, &key, &record(0)).await.unwrap_err(),
            RemoteError::Rejected("quota".into())
        );
        assert!(remote.push(&principal, &key, &record(0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_and_changes() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");
        remote.write_from_other_device(&key, record(0));

        let (count, callback) = counter_callback();
        let handle = remote.subscribe(&principal, &key, callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        remote.write_from_other_device(&key, record(5));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        handle.cancel();
        handle.cancel();
        remote.write_from_other_device(&key, record(10));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(remote.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_subscription_reports_auth_error() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");
        remote.write_from_other_device(&key, record(0));
        remote.set_auth_failure(Some("token expired"));

        let (count, callback) = counter_callback();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let _handle = remote.subscribe_with_errors(
            &principal,
            &key,
            callback,
            Arc::new(move |e: RemoteError| sink.lock().unwrap().push(e)),
        );

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![RemoteError::Auth("token expired".to_string())]
        );
        assert_eq!(remote.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_to_missing_record_waits() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");

        let (count, callback) = counter_callback();
        let _handle = remote.subscribe(&principal, &key, callback);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(remote.listener_count(), 1);

        let principal = remote.authenticate().await.unwrap();
        remote.push(&principal, &key, &record(0)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_delivery_is_dropped_after_cancel() {
        let remote = MemoryRemoteStore::new("u1");
        let principal = remote.authenticate().await.unwrap();
        let key = DocumentKey::new("doc-a");
        remote.write_from_other_device(&key, record(0));
        remote.set_initial_delivery_delay(Some(Duration::from_millis(500)));

        let (count, callback) = counter_callback();
        let handle = remote.subscribe(&principal, &key, callback);
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
