//! Cooperative cancellation for long-running estimations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation flag checked at every robust outer-loop iteration.
///
/// The caller keeps one clone and hands another to the estimator. Setting the
/// flag makes the running `estimate()` return
/// [`Cancelled`](crate::PositioningError::Cancelled) without mutating any
/// output. Timeouts are implemented by the caller through the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of any estimation holding a clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Clear the flag so the token can be reused for another run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}
