use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    set: AtomicBool,
    notify: Notify,
}

/// Run-wide shutdown flag. Set once, never reset.
///
/// Threads poll [`is_set`](Self::is_set); async tasks can [`wait`](Self::wait).
#[derive(Clone, Default)]
pub struct TerminationSignal {
    inner: Arc<Inner>,
}

impl TerminationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        if !self.inner.set.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
