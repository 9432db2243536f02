//! Pending jobs and the handles callers hold on to them.

use crate::cancel::CancellationToken;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Why a job was cancelled.
///
/// Only the first reason given sticks; later cancellations keep it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancellationReason {
    Unset,
    /// Evicted to make room for a fresher job.
    QueueFull,
    Shutdown,
    /// Replaced by a newer job, or a retry that found the queue full.
    Superseded,
    Manual,
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CancellationReason::Unset => "unset",
            CancellationReason::QueueFull => "queue full",
            CancellationReason::Shutdown => "shutdown",
            CancellationReason::Superseded => "superseded",
            CancellationReason::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a job.
#[derive(Debug, Error)]
pub enum JobError<E> {
    #[error("job cancelled ({0})")]
    Cancelled(CancellationReason),
    #[error("{0}")]
    Failed(Arc<E>),
}

impl<E> Clone for JobError<E> {
    fn clone(&self) -> Self {
        match self {
            JobError::Cancelled(reason) => JobError::Cancelled(*reason),
            JobError::Failed(err) => JobError::Failed(Arc::clone(err)),
        }
    }
}

impl<E> JobError<E> {
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        match self {
            JobError::Cancelled(reason) => Some(*reason),
            JobError::Failed(_) => None,
        }
    }
}

/// Final result of a job.
pub type JobOutcome<T, E> = Result<T, JobError<E>>;

/// One scheduled unit of work, shared between the queue, its workers and any
/// [`JobHandle`]s.
pub(crate) struct PendingJob<P, T, E> {
    id: u64,
    params: P,
    attempts: AtomicU32,
    token: CancellationToken,
    reason: Mutex<CancellationReason>,
    outcome: watch::Sender<Option<JobOutcome<T, E>>>,
}

impl<P, T, E> PendingJob<P, T, E> {
    pub(crate) fn new(id: u64, params: P) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            id,
            params,
            attempts: AtomicU32::new(0),
            token: CancellationToken::new(),
            reason: Mutex::new(CancellationReason::Unset),
            outcome,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn params(&self) -> &P {
        &self.params
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Count a new attempt and return its 1-based number.
    pub(crate) fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub(crate) fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.is_cancelled().then(|| *self.reason.lock())
    }

    /// Cancel the job. Returns `false` if it had already finished.
    pub(crate) fn cancel(&self, reason: CancellationReason) -> bool {
        let mut current = self.reason.lock();
        if self.is_done() {
            return false;
        }
        if *current == CancellationReason::Unset {
            *current = reason;
        }
        let reason = *current;
        self.token.cancel();
        self.outcome.send_replace(Some(Err(JobError::Cancelled(reason))));
        true
    }

    /// Resolve the job unless it was cancelled in the meantime.
    pub(crate) fn complete(&self, result: Result<T, E>) {
        let _guard = self.reason.lock();
        if self.is_cancelled() || self.is_done() {
            return;
        }
        let outcome = result.map_err(|err| JobError::Failed(Arc::new(err)));
        self.outcome.send_replace(Some(outcome));
    }
}

/// Cloneable handle to a scheduled job.
pub struct JobHandle<P, T, E> {
    job: Arc<PendingJob<P, T, E>>,
}

impl<P, T, E> Clone for JobHandle<P, T, E> {
    fn clone(&self) -> Self {
        Self {
            job: Arc::clone(&self.job),
        }
    }
}

impl<P, T, E> fmt::Debug for JobHandle<P, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.job.id())
            .field("attempts", &self.job.attempts())
            .field("done", &self.job.is_done())
            .field("cancellation_reason", &self.job.cancellation_reason())
            .finish()
    }
}

impl<P, T, E> JobHandle<P, T, E> {
    pub(crate) fn new(job: Arc<PendingJob<P, T, E>>) -> Self {
        Self { job }
    }

    pub fn id(&self) -> u64 {
        self.job.id()
    }

    pub fn params(&self) -> &P {
        self.job.params()
    }

    pub fn attempts(&self) -> u32 {
        self.job.attempts()
    }

    pub fn is_done(&self) -> bool {
        self.job.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.job.is_cancelled()
    }

    /// `None` unless the job was cancelled.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.job.cancellation_reason()
    }

    /// Cancel manually. A running attempt is abandoned.
    pub fn cancel(&self) -> bool {
        self.job.cancel(CancellationReason::Manual)
    }

    pub fn cancel_with(&self, reason: CancellationReason) -> bool {
        self.job.cancel(reason)
    }
}

impl<P, T: Clone, E> JobHandle<P, T, E> {
    /// Wait for the job to succeed, fail terminally or be cancelled.
    pub async fn wait(&self) -> JobOutcome<T, E> {
        let mut rx = self.job.outcome.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                let reason = self
                    .job
                    .cancellation_reason()
                    .unwrap_or(CancellationReason::Unset);
                return Err(JobError::Cancelled(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestJob = PendingJob<&'static str, u32, String>;

    #[test]
    fn test_first_reason_sticks() {
        let job = TestJob::new(1, "a");
        assert!(job.cancel(CancellationReason::QueueFull));
        assert!(!job.cancel(CancellationReason::Shutdown));
        assert_eq!(job.cancellation_reason(), Some(CancellationReason::QueueFull));
    }

    #[test]
    fn test_complete_after_cancel_is_ignored() {
        let job = TestJob::new(1, "a");
        job.cancel(CancellationReason::Manual);
        job.complete(Ok(5));
        assert!(matches!(
            *job.outcome.borrow(),
            Some(Err(JobError::Cancelled(CancellationReason::Manual)))
        ));
    }

    #[test]
    fn test_cancel_after_complete_fails() {
        let job = TestJob::new(1, "a");
        job.complete(Ok(5));
        assert!(!job.cancel(CancellationReason::Manual));
        assert_eq!(job.cancellation_reason(), None);
    }

    #[test]
    fn test_attempt_counting() {
        let job = TestJob::new(1, "a");
        assert_eq!(job.begin_attempt(), 1);
        assert_eq!(job.begin_attempt(), 2);
        assert_eq!(job.attempts(), 2);
    }

    #[tokio::test]
    async fn test_handle_wait_sees_failure() {
        let job = TestJob::new(7, "a");
        let handle = JobHandle::new(Arc::clone(&job));
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tokio::task::yield_now().await;
        job.complete(Err("boom".to_string()));
        match waiter.await.unwrap() {
            Err(JobError::Failed(err)) => assert_eq!(err.as_str(), "boom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
