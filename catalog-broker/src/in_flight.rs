use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

#[derive(Default)]
struct Tracked {
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
    emptied: Notify,
}

/// Set of background tasks an adapter must drain before shutting down.
/// Entries leave the set when their task finishes, fails or is aborted.
#[derive(Clone, Default)]
pub struct InFlightTasks {
    inner: Arc<Tracked>,
}

struct Membership {
    id: u64,
    inner: Arc<Tracked>,
}

impl Drop for Membership {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks.lock();
        tasks.remove(&self.id);
        if tasks.is_empty() {
            self.inner.emptied.notify_waiters();
        }
    }
}

impl InFlightTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let membership = Membership {
            id,
            inner: Arc::clone(&self.inner),
        };

        // Held across the spawn so a fast task cannot remove itself before it
        // has been inserted.
        let mut tasks = self.inner.tasks.lock();
        let handle = tokio::spawn(async move {
            let _membership = membership;
            future.await;
        });
        tasks.insert(id, handle.abort_handle());
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `timeout` for every tracked task, then aborts whatever is
    /// still running and waits for the aborts to land. Returns the number of
    /// tasks that had to be cancelled.
    pub async fn drain(&self, timeout: Duration) -> usize {
        if self.is_empty() {
            return 0;
        }

        if tokio::time::timeout(timeout, self.wait_empty()).await.is_ok() {
            debug!("All in-flight tasks completed");
            return 0;
        }

        let pending: Vec<AbortHandle> = self.inner.tasks.lock().values().cloned().collect();
        warn!("{} tasks still running, cancelling them", pending.len());
        for handle in &pending {
            handle.abort();
        }
        self.wait_empty().await;
        pending.len()
    }

    async fn wait_empty(&self) {
        loop {
            let notified = self.inner.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn completed_tasks_leave_the_set() {
        let tracker = InFlightTasks::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            tracker.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        let cancelled = tracker.drain(Duration::from_secs(5)).await;
        assert_eq!(cancelled, 0);
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn stragglers_are_cancelled_after_timeout() {
        let tracker = InFlightTasks::new();
        tracker.spawn(async {});
        tracker.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let cancelled = tracker.drain(Duration::from_millis(50)).await;
        assert_eq!(cancelled, 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn draining_an_empty_set_returns_immediately() {
        let tracker = InFlightTasks::new();
        assert_eq!(tracker.drain(Duration::ZERO).await, 0);
    }
}
