//! Storage layer
//!
//! The local store is the durable, authoritative on-device copy of every
//! document's annotations. It also persists the sync queue's pending intents
//! and terminal sync failures so neither is lost across restarts.
//!
//! ## Architecture
//!
//! - **SQLite**: one database file, WAL journal, full fsync on commit
//! - **Blobs**: payloads are stored zstd-compressed (see `codec`)

pub mod error;
pub mod local;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use local::{LocalStore, StorageStats};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
