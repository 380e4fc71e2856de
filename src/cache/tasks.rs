//! Bounded background worker pool.
//!
//! Delayed deletions and background refreshes run here. A semaphore caps
//! how many run at once; a [`TaskTracker`] lets shutdown wait for the
//! in-flight ones.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Handle to a task submitted to a [`TaskPool`].
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    inner: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Wait for the task. Returns `false` if it panicked or was aborted.
    pub async fn join(self) -> bool {
        match self.inner.await {
            Ok(()) => true,
            Err(err) => {
                warn!(task = self.name, error = %err, "background task did not complete");
                false
            }
        }
    }
}

/// Semaphore-limited pool of tracked tokio tasks.
#[derive(Debug, Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl TaskPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn `task` once a permit is free. Must be called inside a runtime.
    pub fn submit<F>(&self, name: &'static str, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let inner = self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(task = name, "worker pool closed; task skipped");
                return;
            };
            task.await;
        });
        TaskHandle { name, inner }
    }

    /// Tasks spawned and not yet finished, including ones waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for every submitted task. Returns `false` when
    /// tasks were still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending = self.tracker.len(),
                    "worker pool shutdown timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn submitted_tasks_run() {
        let pool = TaskPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let ran = Arc::clone(&ran);
                pool.submit("count", async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().await);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = TaskPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit("bounded", async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_or_times_out() {
        let pool = TaskPool::new(1);
        pool.submit("short", tokio::time::sleep(Duration::from_millis(10)));
        assert!(pool.shutdown(Duration::from_secs(1)).await);

        let pool = TaskPool::new(1);
        pool.submit("long", tokio::time::sleep(Duration::from_secs(60)));
        assert!(!pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn panicking_task_reports_failure() {
        let pool = TaskPool::new(1);
        let fail = true;
        let handle = pool.submit("boom", async move {
            if fail {
                panic!("task failure");
            }
        });
        assert!(!handle.join().await);
    }
}
