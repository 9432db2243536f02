//! Fixed pool of workers draining a bounded, delayed job queue.

use super::delayed::TimeDelayedWorkQueue;
use super::job::{CancellationReason, JobHandle, PendingJob};
use super::retry::RetryPolicy;
use super::worker::{QueueShared, QueueWorker};
use crate::error::{MeshbusError, Result};
use crate::logging::ThrottledLogger;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Configuration for a [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct WorkQueueConfig<E> {
    /// Used in log records.
    pub name: String,
    pub num_workers: usize,
    /// `None` leaves the queue unbounded.
    pub max_pending_jobs: Option<usize>,
    pub retry: RetryPolicy<E>,
}

impl<E> Default for WorkQueueConfig<E> {
    fn default() -> Self {
        Self {
            name: "work-queue".to_string(),
            num_workers: 1,
            max_pending_jobs: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl<E> WorkQueueConfig<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Retry forever with full-jitter exponential backoff.
    pub fn exponential_backoff(name: impl Into<String>) -> Self {
        Self::new(name).with_retry(RetryPolicy::exponential_backoff())
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_max_pending_jobs(mut self, max_pending_jobs: Option<usize>) -> Self {
        self.max_pending_jobs = max_pending_jobs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy<E>) -> Self {
        self.retry = retry;
        self
    }
}

/// A queue of jobs processed by `num_workers` concurrent workers.
///
/// Jobs are handed to workers in FIFO order among ready jobs. Jobs may be
/// added before [`WorkQueue::start`]; they run once workers exist.
pub struct WorkQueue<P, T, E> {
    shared: Arc<QueueShared<P, T, E>>,
    num_workers: usize,
    workers: Mutex<Vec<(Arc<QueueWorker<P, T, E>>, JoinHandle<()>)>>,
    next_job_id: AtomicU64,
}

impl<P, T, E> WorkQueue<P, T, E>
where
    P: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
{
    pub fn new<F, Fut>(config: WorkQueueConfig<E>, process: F) -> Result<Self>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        if config.num_workers == 0 {
            return Err(MeshbusError::config("num_workers must be positive"));
        }
        let queue = Arc::new(TimeDelayedWorkQueue::new(config.max_pending_jobs)?);
        let shared = Arc::new(QueueShared {
            name: config.name,
            queue,
            process: Arc::new(move |params| process(params).boxed()),
            retry: config.retry,
            throttled: ThrottledLogger::default(),
        });
        Ok(Self {
            shared,
            num_workers: config.num_workers,
            workers: Mutex::new(Vec::new()),
            next_job_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the workers. Must be called within a tokio runtime. Calling it
    /// again while running is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        self.shared.queue.start();
        for index in 0..self.num_workers {
            workers.push(QueueWorker::spawn(index, Arc::clone(&self.shared)));
        }
        debug!(queue = %self.shared.name, workers = self.num_workers, "Work queue started");
    }

    /// Stop every worker and cancel every pending job with
    /// [`CancellationReason::Shutdown`].
    pub fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for (worker, _task) in &workers {
            worker.shutdown();
        }
        self.shared.queue.shutdown();
    }

    /// Cancel all scheduled jobs and every running job with
    /// [`CancellationReason::Manual`]. Workers keep running.
    pub fn reset(&self) {
        self.shared.queue.clear(CancellationReason::Manual);
        for (worker, _) in self.workers.lock().iter() {
            worker.cancel_current();
        }
    }

    /// Schedule `params` for processing, optionally after `delay`.
    pub fn add_job(&self, params: P, delay: Option<Duration>) -> JobHandle<P, T, E> {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = PendingJob::new(id, params);
        self.shared.queue.add_job(Arc::clone(&job), delay);
        JobHandle::new(job)
    }

    /// No job is scheduled and no worker is busy.
    pub fn idle(&self) -> bool {
        self.shared.queue.scheduled_len() == 0
            && self.workers.lock().iter().all(|(worker, _)| worker.is_idle())
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .iter()
            .any(|(worker, _)| !worker.is_shut_down())
    }

    /// Jobs added but not yet taken by a worker.
    pub fn pending_jobs(&self) -> usize {
        self.shared.queue.scheduled_len()
    }
}

impl<P, T, E> Drop for WorkQueue<P, T, E> {
    fn drop(&mut self) {
        for (worker, task) in self.workers.get_mut().drain(..) {
            worker.shutdown();
            task.abort();
        }
        self.shared.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queueing::job::JobError;
    use crate::queueing::retry::ErrorClass;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_runs_jobs_and_reports_results() {
        let queue = WorkQueue::new(WorkQueueConfig::new("double"), |x: u32| async move {
            Ok::<_, String>(x * 2)
        })
        .unwrap();
        queue.start();

        let a = queue.add_job(2, None);
        let b = queue.add_job(21, None);
        assert_eq!(a.wait().await.unwrap(), 4);
        assert_eq!(b.wait().await.unwrap(), 42);
        assert_eq!(a.attempts(), 1);
    }

    #[tokio::test]
    async fn test_jobs_added_before_start_run_after_start() {
        let queue = WorkQueue::new(WorkQueueConfig::new("late"), |x: u32| async move {
            Ok::<_, String>(x)
        })
        .unwrap();
        let job = queue.add_job(7, None);
        assert!(!queue.idle());
        queue.start();
        assert_eq!(job.wait().await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let config = WorkQueueConfig::new("flaky").with_retry(
            RetryPolicy::new()
                .with_retry_interval(Duration::from_millis(100))
                .with_max_retries(Some(3))
                .with_classifier(|_: &String| ErrorClass::Expected),
        );
        let queue = WorkQueue::new(config, move |_: ()| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .unwrap();
        queue.start();

        let job = queue.add_job((), None);
        assert_eq!(job.wait().await.unwrap(), "done");
        assert_eq!(job.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_resolve_with_error() {
        let config = WorkQueueConfig::new("broken").with_retry(
            RetryPolicy::new()
                .with_retry_interval(Duration::from_millis(10))
                .with_max_retries(Some(1)),
        );
        let queue =
            WorkQueue::new(config, |_: ()| async { Err::<(), _>("broken".to_string()) }).unwrap();
        queue.start();

        let job = queue.add_job((), None);
        match job.wait().await {
            Err(JobError::Failed(err)) => assert_eq!(err.as_str(), "broken"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(job.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_retries_on_unexpected_error() {
        let config = WorkQueueConfig::exponential_backoff("strict").with_retry(
            RetryPolicy::exponential_backoff().with_stop_retries_on_unexpected(true),
        );
        let queue =
            WorkQueue::new(config, |_: ()| async { Err::<(), _>("fatal".to_string()) }).unwrap();
        queue.start();

        let job = queue.add_job((), None);
        assert!(matches!(job.wait().await, Err(JobError::Failed(_))));
        assert_eq!(job.attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let started = Arc::new(Notify::new());
        let signal = Arc::clone(&started);
        let queue = WorkQueue::new(WorkQueueConfig::new("slow"), move |_: ()| {
            let signal = Arc::clone(&signal);
            async move {
                signal.notify_one();
                futures::future::pending::<()>().await;
                Ok::<_, String>(())
            }
        })
        .unwrap();
        queue.start();

        let job = queue.add_job((), None);
        started.notified().await;
        assert!(!queue.idle());
        job.cancel();
        assert!(matches!(
            job.wait().await,
            Err(JobError::Cancelled(CancellationReason::Manual))
        ));

        // The worker survives the cancellation and keeps processing.
        let started_again = queue.add_job((), None);
        started.notified().await;
        queue.reset();
        assert_eq!(
            started_again.cancellation_reason(),
            Some(CancellationReason::Manual)
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_jobs() {
        let queue = WorkQueue::new(WorkQueueConfig::new("stopped"), |_: ()| async {
            Ok::<_, String>(())
        })
        .unwrap();
        let job = queue.add_job((), Some(Duration::from_secs(60)));
        queue.start();
        queue.shutdown();
        assert!(!queue.is_running());
        assert_eq!(job.cancellation_reason(), Some(CancellationReason::Shutdown));

        let rejected = queue.add_job((), None);
        assert_eq!(
            rejected.cancellation_reason(),
            Some(CancellationReason::Shutdown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_after_shutdown_is_cancelled_at_once() {
        let queue = WorkQueue::new(WorkQueueConfig::new("stopped"), |_: ()| async {
            Ok::<_, String>(())
        })
        .unwrap();
        queue.start();
        queue.shutdown();

        let delayed = queue.add_job((), Some(Duration::from_secs(3600)));
        assert_eq!(
            delayed.cancellation_reason(),
            Some(CancellationReason::Shutdown)
        );
        assert_eq!(queue.pending_jobs(), 0);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = WorkQueueConfig::new("none").with_num_workers(0);
        assert!(WorkQueue::new(config, |_: ()| async { Ok::<(), String>(()) }).is_err());
    }
}
