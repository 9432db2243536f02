//! At-most-one-active-job-per-key scheduling on top of [`WorkQueue`].

use super::job::{CancellationReason, JobHandle};
use super::work_queue::{WorkQueue, WorkQueueConfig};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Per-key scheduling options.
#[derive(Debug, Clone)]
pub struct KeyedQueueConfig {
    /// Cancel the active job of a key when a new one is submitted. When
    /// false, the new submission is rejected instead.
    pub replace_existing_job: bool,
    /// Minimum spacing between jobs scheduled for a key.
    pub throttle_window: Option<Duration>,
    /// Drop jobs submitted inside the throttle window rather than delaying
    /// them until it elapses.
    pub drop_throttled_jobs: bool,
    /// Throttle each key on its own, or all keys against the most recent
    /// submission of any key.
    pub independent_key_throttles: bool,
}

impl Default for KeyedQueueConfig {
    fn default() -> Self {
        Self {
            replace_existing_job: true,
            throttle_window: None,
            drop_throttled_jobs: true,
            independent_key_throttles: true,
        }
    }
}

impl KeyedQueueConfig {
    pub fn with_replace_existing_job(mut self, replace: bool) -> Self {
        self.replace_existing_job = replace;
        self
    }

    pub fn with_throttle_window(mut self, window: Option<Duration>) -> Self {
        self.throttle_window = window;
        self
    }

    pub fn with_drop_throttled_jobs(mut self, drop: bool) -> Self {
        self.drop_throttled_jobs = drop;
        self
    }

    pub fn with_independent_key_throttles(mut self, independent: bool) -> Self {
        self.independent_key_throttles = independent;
        self
    }
}

struct KeyedState<K, P, T, E> {
    active: HashMap<K, JobHandle<P, T, E>>,
    last_scheduled: HashMap<K, Instant>,
}

/// A work queue holding at most one active job per key.
///
/// `add_job` returns `None` when the submission was rejected (an active job
/// exists and replacement is disabled) or dropped by the throttle.
pub struct KeyedSingletonWorkQueue<K, P, T, E> {
    queue: WorkQueue<P, T, E>,
    config: KeyedQueueConfig,
    state: Mutex<KeyedState<K, P, T, E>>,
}

impl<K, P, T, E> KeyedSingletonWorkQueue<K, P, T, E>
where
    K: Eq + Hash + Clone + Debug,
    P: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
{
    /// Create the queue. `queue_config.max_pending_jobs` is ignored; keyed
    /// queues are unbounded.
    pub fn new<F, Fut>(
        config: KeyedQueueConfig,
        queue_config: WorkQueueConfig<E>,
        process: F,
    ) -> Result<Self>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let queue = WorkQueue::new(queue_config.with_max_pending_jobs(None), process)?;
        Ok(Self {
            queue,
            config,
            state: Mutex::new(KeyedState {
                active: HashMap::new(),
                last_scheduled: HashMap::new(),
            }),
        })
    }

    pub fn start(&self) {
        self.queue.start();
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn reset(&self) {
        self.queue.reset();
    }

    pub fn idle(&self) -> bool {
        self.queue.idle()
    }

    pub fn add_job(
        &self,
        key: K,
        params: P,
        delay: Option<Duration>,
    ) -> Option<JobHandle<P, T, E>> {
        let mut state = self.state.lock();

        if let Some(existing) = state.active.get(&key).filter(|job| !job.is_done()) {
            if self.config.replace_existing_job {
                debug!(?key, "Cancelling outstanding job for key");
                existing.cancel_with(CancellationReason::Superseded);
            } else {
                debug!(?key, "Not adding job, pending job for key exists");
                return None;
            }
        }

        let mut delay = delay;
        if let Some(window) = self.config.throttle_window {
            let now = Instant::now();
            let last = if self.config.independent_key_throttles {
                state.last_scheduled.get(&key).copied()
            } else {
                state.last_scheduled.values().max().copied()
            };
            if let Some(last) = last {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < window {
                    if self.config.drop_throttled_jobs {
                        debug!(?key, ?elapsed, "Not scheduling throttled job");
                        return None;
                    }
                    let until_window_end = window - elapsed;
                    delay = Some(delay.map_or(until_window_end, |d| d.max(until_window_end)));
                    debug!(?key, ?delay, ?elapsed, "Delaying throttled job");
                }
            }
            state.last_scheduled.insert(key.clone(), now);
        }

        let handle = self.queue.add_job(params, delay);
        state.active.insert(key, handle.clone());
        Some(handle)
    }

    /// Cancel the active job for `key`, if any.
    pub fn cancel_job(&self, key: &K) {
        if let Some(job) = self.state.lock().active.get(key) {
            job.cancel();
        }
    }

    pub fn has_active_job(&self, key: &K) -> bool {
        self.state
            .lock()
            .active
            .get(key)
            .is_some_and(|job| !job.is_done())
    }
}

/// A keyed queue with a single implicit key: only one job of this kind may
/// be active at a time.
pub struct SingletonJobWorkQueue<P, T, E> {
    inner: KeyedSingletonWorkQueue<(), P, T, E>,
    last_job: Mutex<Option<JobHandle<P, T, E>>>,
}

impl<P, T, E> SingletonJobWorkQueue<P, T, E>
where
    P: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Display + Send + Sync + 'static,
{
    pub fn new<F, Fut>(
        config: KeyedQueueConfig,
        queue_config: WorkQueueConfig<E>,
        process: F,
    ) -> Result<Self>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        Ok(Self {
            inner: KeyedSingletonWorkQueue::new(config, queue_config, process)?,
            last_job: Mutex::new(None),
        })
    }

    pub fn start(&self) {
        self.inner.start();
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn idle(&self) -> bool {
        self.inner.idle()
    }

    pub fn add_job(&self, params: P, delay: Option<Duration>) -> Option<JobHandle<P, T, E>> {
        let job = self.inner.add_job((), params, delay)?;
        *self.last_job.lock() = Some(job.clone());
        Some(job)
    }

    pub fn cancel_job(&self) {
        self.inner.cancel_job(&());
    }

    pub fn has_active_job(&self) -> bool {
        self.inner.has_active_job(&())
    }

    /// The most recently accepted job.
    pub fn last_job(&self) -> Option<JobHandle<P, T, E>> {
        self.last_job.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queueing::job::JobError;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn gated_queue(
        config: KeyedQueueConfig,
        gate: Arc<Notify>,
    ) -> KeyedSingletonWorkQueue<&'static str, u32, u32, String> {
        KeyedSingletonWorkQueue::new(config, WorkQueueConfig::new("keyed"), move |x: u32| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok::<_, String>(x)
            }
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_replace_cancels_pending_job() {
        let gate = Arc::new(Notify::new());
        let queue = gated_queue(KeyedQueueConfig::default(), Arc::clone(&gate));

        let a = queue.add_job("k", 1, None).unwrap();
        let b = queue.add_job("k", 2, None).unwrap();
        assert_eq!(a.cancellation_reason(), Some(CancellationReason::Superseded));

        queue.start();
        gate.notify_one();
        assert_eq!(b.wait().await.unwrap(), 2);
        assert!(matches!(a.wait().await, Err(JobError::Cancelled(_))));
        assert!(!queue.has_active_job(&"k"));
    }

    #[tokio::test]
    async fn test_reject_when_not_replacing() {
        let gate = Arc::new(Notify::new());
        let config = KeyedQueueConfig::default().with_replace_existing_job(false);
        let queue = gated_queue(config, Arc::clone(&gate));
        queue.start();

        let a = queue.add_job("k", 1, None).unwrap();
        assert!(queue.add_job("k", 2, None).is_none());
        assert!(queue.has_active_job(&"k"));

        // Other keys are unaffected.
        let other = queue.add_job("other", 3, None);
        assert!(other.is_some());

        gate.notify_one();
        assert_eq!(a.wait().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_drops_jobs_inside_window() {
        let queue: KeyedSingletonWorkQueue<&str, u32, u32, String> = KeyedSingletonWorkQueue::new(
            KeyedQueueConfig::default().with_throttle_window(Some(Duration::from_secs(10))),
            WorkQueueConfig::new("throttled"),
            |x: u32| async move { Ok::<_, String>(x) },
        )
        .unwrap();
        queue.start();

        let first = queue.add_job("k", 1, None).unwrap();
        assert_eq!(first.wait().await.unwrap(), 1);
        assert!(queue.add_job("k", 2, None).is_none());
        assert!(queue.add_job("other", 3, None).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(queue.add_job("k", 4, None).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_throttle_delays_jobs() {
        let queue: KeyedSingletonWorkQueue<&str, u32, u32, String> = KeyedSingletonWorkQueue::new(
            KeyedQueueConfig::default()
                .with_throttle_window(Some(Duration::from_secs(10)))
                .with_drop_throttled_jobs(false)
                .with_independent_key_throttles(false),
            WorkQueueConfig::new("shared-throttle"),
            |x: u32| async move { Ok::<_, String>(x) },
        )
        .unwrap();
        queue.start();

        let started = Instant::now();
        let first = queue.add_job("a", 1, None).unwrap();
        let second = queue.add_job("b", 2, None).unwrap();
        assert_eq!(first.wait().await.unwrap(), 1);
        assert_eq!(second.wait().await.unwrap(), 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_singleton_queue() {
        let gate = Arc::new(Notify::new());
        let signal = Arc::clone(&gate);
        let queue = SingletonJobWorkQueue::new(
            KeyedQueueConfig::default(),
            WorkQueueConfig::new("singleton"),
            move |x: u32| {
                let gate = Arc::clone(&signal);
                async move {
                    gate.notified().await;
                    Ok::<_, String>(x)
                }
            },
        )
        .unwrap();
        queue.start();

        let first = queue.add_job(1, None).unwrap();
        assert!(queue.has_active_job());
        queue.cancel_job();
        assert_eq!(first.cancellation_reason(), Some(CancellationReason::Manual));
        assert!(!queue.has_active_job());

        let second = queue.add_job(2, None).unwrap();
        assert_eq!(queue.last_job().unwrap().id(), second.id());
        gate.notify_one();
        assert_eq!(second.wait().await.unwrap(), 2);
    }
}
