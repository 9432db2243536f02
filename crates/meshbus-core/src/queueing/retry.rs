//! Retry policy for queue workers.
//!
//! Provides:
//! - Constant retry intervals (exponential base of 1)
//! - "Full jitter" exponential backoff otherwise
//! - Caller-supplied error classification deciding log level and whether an
//!   error may be retried at all

use crate::config::QueueConfig;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How a worker treats an error returned by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried silently.
    Expected,
    /// Logged through the throttled logger.
    Throttled,
    /// Logged at error level.
    Unexpected,
}

type Classifier<E> = Arc<dyn Fn(&E) -> ErrorClass + Send + Sync>;

/// Configuration for retry behavior.
pub struct RetryPolicy<E> {
    /// Base delay between attempts.
    pub retry_interval: Duration,
    /// Maximum number of retries after the first attempt. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Exponential base. `1.0` means a constant `retry_interval`.
    pub exponential_base: f64,
    /// Maximum delay cap for exponential backoff.
    pub max_wait: Duration,
    /// Treat every error that is not [`ErrorClass::Expected`] as terminal.
    pub stop_retries_on_unexpected: bool,
    classifier: Classifier<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            retry_interval: self.retry_interval,
            max_retries: self.max_retries,
            exponential_base: self.exponential_base,
            max_wait: self.max_wait,
            stop_retries_on_unexpected: self.stop_retries_on_unexpected,
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_interval", &self.retry_interval)
            .field("max_retries", &self.max_retries)
            .field("exponential_base", &self.exponential_base)
            .field("max_wait", &self.max_wait)
            .field("stop_retries_on_unexpected", &self.stop_retries_on_unexpected)
            .finish_non_exhaustive()
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self {
            retry_interval: Duration::ZERO,
            max_retries: Some(0),
            exponential_base: 1.0,
            max_wait: QueueConfig::DEFAULT_MAX_WAIT,
            stop_retries_on_unexpected: false,
            classifier: Arc::new(|_| ErrorClass::Unexpected),
        }
    }
}

impl<E> RetryPolicy<E> {
    /// No retries; every error is unexpected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry forever with full-jitter backoff starting at one second.
    pub fn exponential_backoff() -> Self {
        Self::default()
            .with_retry_interval(Duration::from_secs(1))
            .with_max_retries(None)
            .with_exponential_base(2.0)
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_stop_retries_on_unexpected(mut self, stop: bool) -> Self {
        self.stop_retries_on_unexpected = stop;
        self
    }

    /// Set the error classifier.
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&E) -> ErrorClass + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn classify(&self, err: &E) -> ErrorClass {
        (self.classifier)(err)
    }

    /// Whether a job that has made `attempts` attempts may run again after an
    /// error of class `class`.
    pub fn should_retry(&self, attempts: u32, class: ErrorClass) -> bool {
        let within_budget = match self.max_retries {
            None => true,
            Some(max) => attempts < max.saturating_add(1),
        };
        let retryable = class == ErrorClass::Expected || !self.stop_retries_on_unexpected;
        within_budget && retryable
    }

    /// Calculate the delay before the next attempt.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if self.exponential_base == 1.0 {
            return self.retry_interval;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let ceiling = self.retry_interval.as_secs_f64() * self.exponential_base.powi(exponent);
        let ceiling = ceiling.min(self.max_wait.as_secs_f64());
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        Duration::from_secs_f64(rng.random_range(0.0..=ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_delay() {
        let policy: RetryPolicy<()> =
            RetryPolicy::new().with_retry_interval(Duration::from_millis(250));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(250));
        assert_eq!(policy.calculate_delay(9), Duration::from_millis(250));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy: RetryPolicy<()> = RetryPolicy::exponential_backoff();
        for attempt in 1..6 {
            let ceiling = Duration::from_secs(2u64.pow(attempt));
            for _ in 0..50 {
                assert!(policy.calculate_delay(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn test_full_jitter_capped_at_max_wait() {
        let policy: RetryPolicy<()> =
            RetryPolicy::exponential_backoff().with_max_wait(Duration::from_secs(3));
        for _ in 0..50 {
            assert!(policy.calculate_delay(30) <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_default_never_retries() {
        let policy: RetryPolicy<()> = RetryPolicy::new();
        assert!(!policy.should_retry(1, ErrorClass::Expected));
    }

    #[test]
    fn test_retry_budget() {
        let policy: RetryPolicy<()> = RetryPolicy::new().with_max_retries(Some(2));
        assert!(policy.should_retry(1, ErrorClass::Unexpected));
        assert!(policy.should_retry(2, ErrorClass::Unexpected));
        assert!(!policy.should_retry(3, ErrorClass::Unexpected));
    }

    #[test]
    fn test_stop_on_unexpected() {
        let policy: RetryPolicy<&str> = RetryPolicy::exponential_backoff()
            .with_stop_retries_on_unexpected(true)
            .with_classifier(|e: &&str| {
                if *e == "flaky" {
                    ErrorClass::Expected
                } else {
                    ErrorClass::Throttled
                }
            });
        assert!(policy.should_retry(10, policy.classify(&"flaky")));
        assert!(!policy.should_retry(1, policy.classify(&"broken")));
    }
}
