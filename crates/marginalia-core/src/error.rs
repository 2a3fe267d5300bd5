//! Engine error type

use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced by the sync engine
///
/// Remote failures are absorbed by the engine (the save is queued instead),
/// so the only failure callers see is the local store losing or rejecting
/// the operation.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// User-facing hint for resolving the error, when there is one
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::Storage(e) => e.recovery_suggestion(),
        }
    }
}
