//! Bounded FIFO of pending jobs with optional per-job submission delay.

use super::job::{CancellationReason, PendingJob};
use crate::error::{MeshbusError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

type Job<P, T, E> = Arc<PendingJob<P, T, E>>;

struct DelayedState<P, T, E> {
    /// Every job that has been added but not yet handed to a worker, in
    /// submission order, including jobs still waiting on their delay.
    scheduled: VecDeque<Job<P, T, E>>,
    /// Jobs whose delay has elapsed, in the order they became ready.
    ready: VecDeque<Job<P, T, E>>,
    active: bool,
}

/// Job queue shared by the workers of a [`super::WorkQueue`].
///
/// When bounded, a full queue evicts its oldest scheduled job to admit a fresh
/// one, while a retry that finds the queue full is dropped instead.
pub struct TimeDelayedWorkQueue<P, T, E> {
    max_pending_jobs: Option<usize>,
    state: Mutex<DelayedState<P, T, E>>,
    ready_notify: Notify,
}

impl<P, T, E> TimeDelayedWorkQueue<P, T, E> {
    pub fn new(max_pending_jobs: Option<usize>) -> Result<Self> {
        if max_pending_jobs == Some(0) {
            return Err(MeshbusError::config("max_pending_jobs must be positive"));
        }
        Ok(Self {
            max_pending_jobs,
            state: Mutex::new(DelayedState {
                scheduled: VecDeque::new(),
                ready: VecDeque::new(),
                active: true,
            }),
            ready_notify: Notify::new(),
        })
    }

    /// Reactivate after a shutdown.
    pub fn start(&self) {
        self.state.lock().active = true;
    }

    /// Stop handing out jobs and cancel everything scheduled with
    /// [`CancellationReason::Shutdown`].
    pub fn shutdown(&self) {
        self.state.lock().active = false;
        self.clear(CancellationReason::Shutdown);
        self.ready_notify.notify_waiters();
    }

    /// Cancel every scheduled job with `reason`.
    pub fn clear(&self, reason: CancellationReason) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.ready.clear();
            state.scheduled.drain(..).collect()
        };
        for job in drained {
            job.cancel(reason);
        }
    }

    /// Number of jobs added but not yet taken by a worker.
    pub fn scheduled_len(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }
}

impl<P, T, E> TimeDelayedWorkQueue<P, T, E>
where
    P: Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn add_job(self: &Arc<Self>, job: Job<P, T, E>, delay: Option<Duration>) {
        let mut to_cancel = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.active {
                drop(state);
                job.cancel(CancellationReason::Shutdown);
                return;
            }
            state.scheduled.retain(|scheduled| !scheduled.is_cancelled());

            if let Some(max) = self.max_pending_jobs {
                if state.scheduled.len() >= max {
                    if job.attempts() > 0 {
                        drop(state);
                        debug!(job_id = job.id(), "Queue full, dropping retry");
                        job.cancel(CancellationReason::Superseded);
                        return;
                    }
                    while state.scheduled.len() >= max {
                        let Some(oldest) = state.scheduled.pop_front() else {
                            break;
                        };
                        state.ready.retain(|ready| !Arc::ptr_eq(ready, &oldest));
                        to_cancel.push(oldest);
                    }
                }
            }

            state.scheduled.push_back(Arc::clone(&job));
        }
        for evicted in to_cancel {
            debug!(job_id = evicted.id(), "Queue full, evicting oldest job");
            evicted.cancel(CancellationReason::QueueFull);
        }

        match delay {
            Some(delay) if !delay.is_zero() => {
                let queue = Arc::clone(self);
                tokio::spawn(async move {
                    let token = job.token().clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => queue.submit(job),
                        _ = token.cancelled() => queue.remove_scheduled(&job),
                    }
                });
            }
            _ => self.submit(job),
        }
    }

    fn submit(&self, job: Job<P, T, E>) {
        let mut state = self.state.lock();
        if job.is_cancelled() {
            state.scheduled.retain(|scheduled| !Arc::ptr_eq(scheduled, &job));
            return;
        }
        if !state.active {
            state.scheduled.retain(|scheduled| !Arc::ptr_eq(scheduled, &job));
            drop(state);
            job.cancel(CancellationReason::Shutdown);
            return;
        }
        state.ready.push_back(job);
        drop(state);
        self.ready_notify.notify_one();
    }

    fn remove_scheduled(&self, job: &Job<P, T, E>) {
        self.state
            .lock()
            .scheduled
            .retain(|scheduled| !Arc::ptr_eq(scheduled, job));
    }

    /// Wait for the next ready job that has not been cancelled. Returns
    /// `None` once the queue has been shut down.
    pub(crate) async fn next_job(&self) -> Option<Job<P, T, E>> {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if !state.active {
                    return None;
                }
                while let Some(job) = state.ready.pop_front() {
                    state
                        .scheduled
                        .retain(|scheduled| !Arc::ptr_eq(scheduled, &job));
                    if job.is_cancelled() {
                        continue;
                    }
                    return Some(job);
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Queue = TimeDelayedWorkQueue<u32, (), String>;

    fn job(id: u64) -> Job<u32, (), String> {
        PendingJob::new(id, id as u32)
    }

    #[test]
    fn test_zero_bound_rejected() {
        assert!(Queue::new(Some(0)).is_err());
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest() {
        let queue = Arc::new(Queue::new(Some(2)).unwrap());
        let (a, b, c) = (job(1), job(2), job(3));
        queue.add_job(Arc::clone(&a), None);
        queue.add_job(Arc::clone(&b), None);
        queue.add_job(Arc::clone(&c), None);

        assert_eq!(a.cancellation_reason(), Some(CancellationReason::QueueFull));
        assert!(!b.is_cancelled());
        assert!(!c.is_cancelled());
        assert_eq!(queue.next_job().await.unwrap().id(), 2);
        assert_eq!(queue.next_job().await.unwrap().id(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_retry() {
        let queue = Arc::new(Queue::new(Some(2)).unwrap());
        let (a, b, retry) = (job(1), job(2), job(3));
        retry.begin_attempt();
        queue.add_job(Arc::clone(&a), None);
        queue.add_job(Arc::clone(&b), None);
        queue.add_job(Arc::clone(&retry), None);

        assert_eq!(
            retry.cancellation_reason(),
            Some(CancellationReason::Superseded)
        );
        assert!(!a.is_cancelled());
        assert!(!b.is_cancelled());
        assert_eq!(queue.scheduled_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_becomes_ready() {
        let queue = Arc::new(Queue::new(None).unwrap());
        queue.add_job(job(1), Some(Duration::from_secs(5)));
        queue.add_job(job(2), None);

        assert_eq!(queue.next_job().await.unwrap().id(), 2);
        let next = queue.next_job().await.unwrap();
        assert_eq!(next.id(), 1);
        assert_eq!(queue.scheduled_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_timer_removes_job() {
        let queue = Arc::new(Queue::new(None).unwrap());
        let delayed = job(1);
        queue.add_job(Arc::clone(&delayed), Some(Duration::from_secs(60)));
        assert_eq!(queue.scheduled_len(), 1);

        delayed.cancel(CancellationReason::Manual);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.scheduled_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_ends_iteration() {
        let queue = Arc::new(Queue::new(None).unwrap());
        let pending = job(1);
        queue.add_job(Arc::clone(&pending), None);
        queue.shutdown();

        assert_eq!(
            pending.cancellation_reason(),
            Some(CancellationReason::Shutdown)
        );
        assert!(queue.next_job().await.is_none());

        let late = job(2);
        queue.add_job(Arc::clone(&late), None);
        assert_eq!(late.cancellation_reason(), Some(CancellationReason::Shutdown));
    }
}
