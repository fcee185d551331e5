//! A small cooperative cancellation primitive.
//!
//! Channel-based signaling (`mpsc::UnboundedSender<Command>`) is the
//! usual way to tell a task to stop from outside itself. `CancelToken`
//! generalizes that to a clonable, idempotent, poll-from-anywhere signal
//! for callers that just need "abort() is idempotent and safe from
//! within a callback" without pulling in `tokio_util`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this token cancelled. Idempotent — calling twice is a no-op
    /// the second time.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for the
    /// next `cancel()` call.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
