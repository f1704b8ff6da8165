use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Calls a function when dropped.
///
/// This is useful to run cleanup when a spawned task finishes, no matter whether it completes,
/// panics or is cancelled.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Counts background tasks and lets callers wait until none is left.
#[derive(Debug, Default)]
pub struct PendingTasks {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingTasks {
    /// Registers one task. The task counts as pending until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> CallOnDrop {
        self.count.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        CallOnDrop::new(move || {
            if this.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.idle.notify_waiters();
            }
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once no task is pending.
    ///
    /// Tasks registered while waiting are waited for as well.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            idle.await;
        }
    }
}
