//! Remote store client
//!
//! The remote store is the convergence target for every device's
//! annotations. Records live at
//! `users/{principal}/annotations/{document key}` and are resolved
//! last-write-wins on `lastUpdated`.
//!
//! ## Implementations
//!
//! - `WsRemoteStore`: WebSocket client speaking CBOR messages
//! - `MemoryRemoteStore`: in-process store with fault injection
//! - `DisabledRemote`: stand-in when sync is not configured

mod memory;
mod message;
mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::models::{AnnotationPayload, DocumentKey};
use crate::subscription::CancelHandle;

pub use memory::MemoryRemoteStore;
pub use message::{ClientMessage, ServerMessage, PROTOCOL_V1};
pub use ws::WsRemoteStore;

/// Authenticated sync identity
///
/// Opaque to the engine apart from `id`, which scopes the remote path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub token: String,
}

/// A document's annotations as stored remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Serialized payload envelope
    pub annotations: String,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl RemoteRecord {
    pub fn from_payload(
        payload: &AnnotationPayload,
        last_updated: DateTime<Utc>,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            annotations: codec::serialize(payload)?,
            last_updated,
        })
    }

    pub fn payload(&self) -> Result<AnnotationPayload, CodecError> {
        codec::deserialize(&self.annotations)
    }

    /// Last-write-wins: whether this record should replace `other`
    pub fn supersedes(&self, other: &RemoteRecord) -> bool {
        self.last_updated >= other.last_updated
    }
}

/// Remote acknowledgement of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub document_key: DocumentKey,
    /// Timestamp of the record the remote now holds
    pub last_updated: DateTime<Utc>,
    /// False when the remote already held a newer record
    pub applied: bool,
}

/// Errors from the remote store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transient transport failure; the device is presumed offline
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials missing, expired or refused
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Any other refusal by the remote
    #[error("Remote rejected request: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Auth(_))
    }
}

/// Callback invoked with each remote change to a subscribed record
pub type UpdateCallback = Arc<dyn Fn(RemoteRecord) + Send + Sync>;

/// Callback invoked once if a subscription ends on an error
pub type ErrorCallback = Arc<dyn Fn(RemoteError) + Send + Sync>;

/// Remote annotation store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Obtain a principal for this device
    ///
    /// Callers cache the result and retry on failure themselves.
    async fn authenticate(&self) -> Result<Principal, RemoteError>;

    /// Write a record. Re-pushing an identical record is harmless.
    async fn push(
        &self,
        principal: &Principal,
        key: &DocumentKey,
        record: &RemoteRecord,
    ) -> Result<Ack, RemoteError>;

    /// Listen for changes to a record
    ///
    /// The current value, if any, is delivered first. `on_update` fires at
    /// most once per remote change and never after the handle is cancelled.
    fn subscribe(
        &self,
        principal: &Principal,
        key: &DocumentKey,
        on_update: UpdateCallback,
    ) -> CancelHandle {
        self.subscribe_with_errors(principal, key, on_update, Arc::new(|_: RemoteError| {}))
    }

    /// Like `subscribe`, also reporting the error that ends the subscription
    ///
    /// `on_error` fires at most once, and never after the handle is
    /// cancelled. An `Auth` error means the principal was refused.
    fn subscribe_with_errors(
        &self,
        principal: &Principal,
        key: &DocumentKey,
        on_update: UpdateCallback,
        on_error: ErrorCallback,
    ) -> CancelHandle;
}

/// Path of a record in the remote namespace
pub fn record_path(principal_id: &str, key: &DocumentKey) -> String {
    format!("users/{}/annotations/{}", principal_id, key.encoded())
}

/// Remote used when sync is not configured
///
/// Every call fails with `Network`, so saves stay queued until a real remote
/// is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRemote;

#[async_trait]
impl RemoteStore for DisabledRemote {
    async fn authenticate(&self) -> Result<Principal, RemoteError> {
        Err(RemoteError::Network("sync is not configured".to_string()))
    }

    async fn push(
        &self,
        _principal: &Principal,
        _key: &DocumentKey,
        _record: &RemoteRecord,
    ) -> Result<Ack, RemoteError> {
        Err(RemoteError::Network("sync is not configured".to_string()))
    }

    fn subscribe_with_errors(
        &self,
        _principal: &Principal,
        _key: &DocumentKey,
        _on_update: UpdateCallback,
        on_error: ErrorCallback,
    ) -> CancelHandle {
        on_error(RemoteError::Network("sync is not configured".to_string()));
        CancelHandle::noop()
    }
}
