//! Worker loop that drains a [`TimeDelayedWorkQueue`].

use super::delayed::TimeDelayedWorkQueue;
use super::job::{CancellationReason, PendingJob};
use super::retry::{ErrorClass, RetryPolicy};
use crate::cancel::CancellationToken;
use crate::logging::ThrottledLogger;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error};

pub(crate) type ProcessFn<P, T, E> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// State shared by every worker of one queue.
pub(crate) struct QueueShared<P, T, E> {
    pub(crate) name: String,
    pub(crate) queue: Arc<TimeDelayedWorkQueue<P, T, E>>,
    pub(crate) process: ProcessFn<P, T, E>,
    pub(crate) retry: RetryPolicy<E>,
    pub(crate) throttled: ThrottledLogger,
}

pub(crate) struct QueueWorker<P, T, E> {
    index: usize,
    shared: Arc<QueueShared<P, T, E>>,
    shutdown: CancellationToken,
    current: Mutex<Option<Arc<PendingJob<P, T, E>>>>,
}

impl<P, T, E> QueueWorker<P, T, E> {
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// True when no job is running on this worker.
    pub(crate) fn is_idle(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_none_or(|job| job.is_done())
    }

    /// Cancel the job this worker is running, if any.
    pub(crate) fn cancel_current(&self) {
        if let Some(job) = self.current.lock().as_ref() {
            job.cancel(CancellationReason::Manual);
        }
    }
}

impl<P, T, E> QueueWorker<P, T, E>
where
    P: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
{
    pub(crate) fn spawn(
        index: usize,
        shared: Arc<QueueShared<P, T, E>>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let worker = Arc::new(Self {
            index,
            shared,
            shutdown: CancellationToken::new(),
            current: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&worker).run());
        (worker, task)
    }

    async fn run(self: Arc<Self>) {
        debug!(queue = %self.shared.name, worker = self.index, "Queue worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                job = self.shared.queue.next_job() => job,
            };
            let Some(job) = next else {
                break;
            };
            *self.current.lock() = Some(Arc::clone(&job));
            self.attempt(&job).await;
            *self.current.lock() = None;
        }
        debug!(queue = %self.shared.name, worker = self.index, "Queue worker stopped");
    }

    async fn attempt(&self, job: &Arc<PendingJob<P, T, E>>) {
        let attempt = job.begin_attempt();
        let token = job.token().clone();
        let work = (self.shared.process)(job.params().clone());

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                job.cancel(CancellationReason::Shutdown);
                return;
            }
            // Cancelling a job abandons its attempt; that is not a failure.
            _ = token.cancelled() => {
                debug!(queue = %self.shared.name, job_id = job.id(), "Job cancelled mid-attempt");
                return;
            }
            result = work => result,
        };

        match result {
            Ok(value) => job.complete(Ok(value)),
            Err(err) => self.handle_failure(job, err, attempt),
        }
    }

    fn handle_failure(&self, job: &Arc<PendingJob<P, T, E>>, err: E, attempt: u32) {
        let policy = &self.shared.retry;
        let class = policy.classify(&err);
        match class {
            ErrorClass::Expected => {
                debug!(queue = %self.shared.name, job_id = job.id(), attempt, error = %err, "Expected error processing job");
            }
            ErrorClass::Throttled => {
                self.shared.throttled.error(
                    &self.shared.name,
                    format!("Got error processing job in {}: {}", self.shared.name, err),
                );
            }
            ErrorClass::Unexpected => {
                error!(queue = %self.shared.name, job_id = job.id(), attempt, error = %err, "Got error processing job");
            }
        }

        if policy.should_retry(attempt, class) {
            let delay = policy.calculate_delay(attempt);
            debug!(queue = %self.shared.name, job_id = job.id(), ?delay, "Rescheduling job");
            self.shared.queue.add_job(Arc::clone(job), Some(delay));
        } else {
            job.complete(Err(err));
        }
    }
}
