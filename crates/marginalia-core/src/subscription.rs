//! Cancelable listener handles
//!
//! Every subscription in this crate (remote record updates, connectivity
//! changes) returns a `CancelHandle`. Cancelling detaches the listener: no
//! callback fires afterwards. It does not wait for in-flight network work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type CancelFn = Box<dyn FnOnce() + Send>;

struct CancelState {
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<CancelFn>>,
}

/// Handle to an active subscription
///
/// `cancel` is idempotent. Dropping the handle cancels the subscription.
pub struct CancelHandle {
    state: Arc<CancelState>,
}

/// Read-only view of a handle's state, held by the listener side
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Create a handle that runs `on_cancel` the first time it is cancelled
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    /// A handle with nothing to tear down
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let on_cancel = match self.state.on_cancel.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}
