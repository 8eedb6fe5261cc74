//! Tracked fire-and-forget tasks (title and cover generation).
//!
//! Tasks run detached from the run that started them but stay owned by the
//! manager, so shutdown can wait for them instead of leaking them.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;

pub const DEFAULT_MAX_TASKS: usize = 8;

pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
    max_tasks: usize,
}

impl BackgroundTasks {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            max_tasks,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn `future` as a tracked task. Returns `false` (and drops the
    /// future) when the set is already at capacity.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        reap_finished(&mut tasks);
        if tasks.len() >= self.max_tasks {
            tracing::warn!(task = name, limit = self.max_tasks, "background task limit reached, skipping");
            return false;
        }
        tasks.spawn(future);
        true
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        let mut tasks = self.tasks();
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// Wait for every tracked task, up to `timeout`. Whatever is still
    /// running afterwards is aborted. Returns `true` if all tasks finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut tasks = std::mem::take(&mut *self.tasks());

        let finished = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "background task panicked");
                }
            }
        })
        .await
        .is_ok();

        if !finished {
            tracing::warn!(remaining = tasks.len(), "aborting background tasks after drain timeout");
            tasks.abort_all();
        }
        finished
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TASKS)
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            tracing::warn!(error = %e, "background task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spawn_and_drain() {
        let tasks = BackgroundTasks::default();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            assert!(tasks.spawn("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(tasks.drain(Duration::from_secs(1)).await);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let tasks = BackgroundTasks::new(2);
        assert!(tasks.spawn("a", std::future::pending()));
        assert!(tasks.spawn("b", std::future::pending()));
        assert!(!tasks.spawn("c", async {}));
        assert_eq!(tasks.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_finished_tasks_free_slots() {
        let tasks = BackgroundTasks::new(1);
        assert!(tasks.spawn("a", async {}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tasks.spawn("b", async {}));
    }

    #[tokio::test]
    async fn test_drain_timeout_aborts() {
        let tasks = BackgroundTasks::default();
        tasks.spawn("stuck", std::future::pending());
        assert!(!tasks.drain(Duration::from_millis(50)).await);
        assert_eq!(tasks.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_is_swallowed() {
        let tasks = BackgroundTasks::default();
        tasks.spawn("boom", async { panic!("boom") });
        assert!(tasks.drain(Duration::from_secs(1)).await);
    }
}
