//! Marginalia Core Library
//!
//! Offline-first storage and synchronization for per-document annotations
//! (drawing strokes and text notes attached to a document a viewer has open).
//!
//! # Architecture
//!
//! - **Local store**: SQLite, the durable on-device copy. Every save lands
//!   here first.
//! - **Remote store**: the convergence target, reached through the
//!   `RemoteStore` trait (WebSocket client or in-memory store).
//! - **Sync queue**: durable pending-intent copies of writes the remote has
//!   not acknowledged yet, drained in order when connectivity returns.
//! - **Sync engine**: the orchestrator tying the pieces together.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let local = Arc::new(LocalStore::open(&config)?);
//! let remote: Arc<dyn RemoteStore> = Arc::new(WsRemoteStore::new(url, device_id));
//! let engine = SyncEngine::new(local, remote, EngineOptions::from_config(&config))?;
//!
//! engine.save(&key, payload).await?;
//! let loaded = engine.load(&key).await?;
//! ```
//!
//! # Modules
//!
//! - `engine`: Sync orchestrator (main entry point)
//! - `models`: Annotation payloads and records
//! - `codec`: Versioned payload serialization and compression
//! - `storage`: SQLite local store
//! - `remote`: Remote store trait and implementations
//! - `queue`: Durable, coalescing sync queue
//! - `connectivity`: Edge-triggered reachability monitor
//! - `subscription`: Cancelable listener handles
//! - `config`: Application configuration

pub mod codec;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod models;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod subscription;

pub use codec::CodecError;
pub use config::Config;
pub use connectivity::{spawn_probe, ConnectivityMonitor, ReachabilityProbe, TcpProbe};
pub use engine::{
    EngineOptions, LoadSource, Loaded, SaveOutcome, SyncEngine, SyncEvent, SyncStatus,
};
pub use error::SyncError;
pub use models::{
    AnnotationPayload, AnnotationRecord, DocumentKey, RecordSyncState, Stroke, TextAnnotation,
    Tool,
};
pub use queue::{DrainResult, QueueEntry, SyncQueue, TerminalFailure, DEFAULT_MAX_ATTEMPTS};
pub use remote::{
    Ack, DisabledRemote, MemoryRemoteStore, Principal, RemoteError, RemoteRecord, RemoteStore,
    WsRemoteStore,
};
pub use storage::{LocalStore, StorageError, StorageStats};
pub use subscription::CancelHandle;
