//! Bounded scheduler for independent evaluation tasks.
//!
//! Tasks are admitted in submission order, at most `limit` at a time, and
//! their results come back index-aligned with the input regardless of
//! completion order.

use crate::models::{EvalError, Result};
use indicatif::ProgressBar;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Read-only view of scheduler progress.
///
/// Cheap to clone and never blocks the scheduler.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    completed: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl Progress {
    /// Tasks finished so far, successfully or not. Never decreases.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Tasks submitted so far.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Tasks admitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Holds a task's concurrency permit for as long as the task runs.
///
/// Dropping the slot, on any exit path including a panic, releases the
/// permit and advances the progress counters.
struct TaskSlot {
    _permit: OwnedSemaphorePermit,
    progress: Progress,
    bar: Option<ProgressBar>,
}

impl TaskSlot {
    fn enter(permit: OwnedSemaphorePermit, progress: Progress, bar: Option<ProgressBar>) -> Self {
        progress.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            progress,
            bar,
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.progress.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.progress.completed.fetch_add(1, Ordering::AcqRel);
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }
}

/// Runs futures with a fixed concurrency ceiling.
pub struct BoundedScheduler {
    semaphore: Arc<Semaphore>,
    limit: usize,
    progress: Progress,
    bar: Option<ProgressBar>,
}

impl BoundedScheduler {
    /// Create a scheduler admitting at most `limit` tasks at once.
    ///
    /// A limit of zero is raised to one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            progress: Progress::default(),
            bar: None,
        }
    }

    /// Report into an existing `Progress` handle instead of a fresh one.
    ///
    /// Counters keep accumulating across every scheduler sharing the handle.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Advance `bar` by one for every finished task.
    pub fn with_progress_bar(mut self, bar: ProgressBar) -> Self {
        self.bar = Some(bar);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Run every task and return their results in submission order.
    ///
    /// A task's error or panic is stored in its own slot; it never stops
    /// the remaining tasks.
    pub async fn run_all<I, Fut, T>(&self, tasks: I) -> Vec<Result<T>>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let tasks: Vec<Fut> = tasks.into_iter().collect();
        self.progress.total.fetch_add(tasks.len(), Ordering::AcqRel);

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            // Admission happens here, in submission order.
            let slot = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map(|permit| TaskSlot::enter(permit, self.progress.clone(), self.bar.clone()))
                .map_err(|_| EvalError::Internal("Semaphore closed".to_string()));
            handles.push(tokio::spawn(async move {
                let _slot = slot?;
                task.await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(index, error = %e, "Task panicked");
                    Err(EvalError::Internal(format!("Task {index} panicked: {e}")))
                }
            };
            results.push(result);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let scheduler = BoundedScheduler::new(10);
        let progress = scheduler.progress();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..100u64).map(|i| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let progress = progress.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(now <= 10, "{now} tasks active");
                assert!(progress.in_flight() <= 10);
                peak.fetch_max(now, Ordering::SeqCst);

                // Scrambled durations so completion order differs from submission order.
                tokio::time::sleep(Duration::from_millis((i * 37) % 23 + 1)).await;

                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, EvalError>(i)
            }
        });

        let results = scheduler.run_all(tasks).await;

        assert_eq!(results.len(), 100);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i as u64);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 10);
        assert_eq!(progress.completed(), 100);
        assert_eq!(progress.total(), 100);
        assert_eq!(progress.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_submission_order() {
        let scheduler = BoundedScheduler::new(8);
        let finished = Arc::new(Mutex::new(Vec::new()));

        let tasks = (0..8u64).map(|i| {
            let finished = Arc::clone(&finished);
            async move {
                // Later tasks finish first.
                tokio::time::sleep(Duration::from_millis(100 - i * 10)).await;
                finished.lock().unwrap().push(i);
                Ok::<_, EvalError>(format!("task-{i}"))
            }
        });

        let results = scheduler.run_all(tasks).await;
        let names: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(names, (0..8).map(|i| format!("task-{i}")).collect::<Vec<_>>());
        assert_eq!(*finished.lock().unwrap(), [7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_is_fifo() {
        let scheduler = BoundedScheduler::new(1);
        let started = Arc::new(Mutex::new(Vec::new()));

        let tasks = (0..20usize).map(|i| {
            let started = Arc::clone(&started);
            async move {
                started.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok::<_, EvalError>(())
            }
        });

        scheduler.run_all(tasks).await;
        assert_eq!(*started.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failures_stay_in_their_slot() {
        let scheduler = BoundedScheduler::new(2);
        let progress = scheduler.progress();

        let tasks = (0..6usize).map(|i| async move {
            match i {
                2 => Err(EvalError::InvalidInput("bad sample".to_string())),
                4 => panic!("task blew up"),
                _ => Ok(i * 10),
            }
        });

        let results = scheduler.run_all(tasks).await;
        assert_eq!(results.len(), 6);
        assert_eq!(results[0].as_ref().unwrap(), &0);
        assert!(matches!(results[2], Err(EvalError::InvalidInput(_))));
        assert!(matches!(results[4], Err(EvalError::Internal(_))));
        assert_eq!(results[5].as_ref().unwrap(), &50);

        // Permits from the failed and panicked tasks were released.
        assert_eq!(progress.completed(), 6);
        assert_eq!(progress.in_flight(), 0);
        assert_eq!(scheduler.semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_shared_progress_handle() {
        let progress = Progress::default();
        let first = BoundedScheduler::new(4).with_progress(progress.clone());
        let second = BoundedScheduler::new(2).with_progress(progress.clone());

        first
            .run_all((0..5).map(|i| async move { Ok::<_, EvalError>(i) }))
            .await;
        assert_eq!(progress.completed(), 5);
        assert_eq!(progress.total(), 5);

        second
            .run_all((0..3).map(|i| async move { Ok::<_, EvalError>(i) }))
            .await;
        assert_eq!(progress.completed(), 8);
        assert_eq!(progress.total(), 8);
        assert_eq!(progress.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_progress_bar_and_empty_batch() {
        let bar = ProgressBar::hidden();
        let scheduler = BoundedScheduler::new(0).with_progress_bar(bar.clone());
        assert_eq!(scheduler.limit(), 1);

        let empty: Vec<std::future::Ready<Result<()>>> = Vec::new();
        assert!(scheduler.run_all(empty).await.is_empty());

        let results = scheduler
            .run_all((0..3).map(|i| async move { Ok::<_, EvalError>(i) }))
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(bar.position(), 3);
    }
}
