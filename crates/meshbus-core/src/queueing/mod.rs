//! Retrying, cancellable job scheduling.
//!
//! - [`WorkQueue`]: a fixed pool of workers draining a (optionally bounded)
//!   FIFO with per-job delays and a [`RetryPolicy`].
//! - [`KeyedSingletonWorkQueue`]: at most one active job per key, with
//!   optional throttling.
//! - [`SingletonJobWorkQueue`]: the single-key case.
//!
//! Every job is observed through a [`JobHandle`]; a cancelled job resolves
//! with the [`CancellationReason`] that cancelled it.

mod delayed;
mod job;
mod keyed;
mod retry;
mod work_queue;
mod worker;

pub use delayed::TimeDelayedWorkQueue;
pub use job::{CancellationReason, JobError, JobHandle, JobOutcome};
pub use keyed::{KeyedQueueConfig, KeyedSingletonWorkQueue, SingletonJobWorkQueue};
pub use retry::{ErrorClass, RetryPolicy};
pub use work_queue::{WorkQueue, WorkQueueConfig};
