use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Token for signaling stop to cooperating tasks.
///
/// Clones share state: stopping any clone wakes every task waiting on any
/// other clone. The pool uses one token per worker on top of a pool-wide
/// token, so a shrink can retire individual workers without disturbing a
/// later full stop.
#[derive(Clone, Debug)]
pub struct StopToken {
    inner: Arc<StopTokenInner>,
}

#[derive(Debug)]
struct StopTokenInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopToken {
    /// Create a new stop token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopTokenInner {
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal stop.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if stop has been signalled.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait until stop is signalled.
    pub async fn stopped(&self) {
        // Register interest before re-checking the flag so a stop() between
        // the check and the await cannot be missed.
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}
