//! Outbound reconnection backoff.
//!
//! The delay before an attempt grows linearly with the attempt number and is
//! stretched further whenever a rate window is already full of recent
//! attempts. The cap applies after the windows, so they are not a hard limit.

use crate::config::ConnectionConfig;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for outbound connection backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Added per failed attempt.
    pub step: Duration,
    /// First delay after an established connection drops.
    pub reconnect_delay: Duration,
    /// Maximum delay cap, applied before jitter.
    pub max_backoff: Duration,
    /// Delays are scaled by a uniform factor in `1 ± jitter_ratio`.
    pub jitter_ratio: f64,
    /// (window, max attempts inside the window)
    pub rate_windows: Vec<(Duration, usize)>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            step: ConnectionConfig::BACKOFF_STEP,
            reconnect_delay: ConnectionConfig::RECONNECT_INITIAL_BACKOFF,
            max_backoff: ConnectionConfig::MAX_BACKOFF,
            jitter_ratio: ConnectionConfig::JITTER_RATIO,
            rate_windows: ConnectionConfig::RATE_WINDOWS.to_vec(),
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_rate_windows(mut self, windows: Vec<(Duration, usize)>) -> Self {
        self.rate_windows = windows;
        self
    }

    /// Number of attempt timestamps worth remembering.
    pub fn history_len(&self) -> usize {
        self.rate_windows
            .iter()
            .map(|(_, max_attempts)| *max_attempts)
            .max()
            .unwrap_or(0)
    }

    /// Delay before attempt `attempt` (0-based within one connect loop),
    /// before jitter.
    ///
    /// `history` holds previous attempt times, most recent first.
    pub fn compute_backoff(
        &self,
        attempt: u32,
        is_reconnect: bool,
        history: &VecDeque<Instant>,
        now: Instant,
    ) -> Duration {
        let mut backoff = if is_reconnect && attempt == 0 {
            self.reconnect_delay
        } else {
            self.step.saturating_mul(attempt)
        };

        let mut counts = vec![0usize; self.rate_windows.len()];
        for past in history {
            let age = now.saturating_duration_since(*past);
            for (count, (window, max_attempts)) in counts.iter_mut().zip(&self.rate_windows) {
                if age < *window {
                    *count += 1;
                    // Full: wait for the oldest attempt in the window to age out.
                    if *count == *max_attempts {
                        backoff = backoff.max(*window - age);
                    }
                }
            }
        }

        backoff.min(self.max_backoff)
    }

    /// Scale `backoff` by a random factor in `1 ± jitter_ratio`.
    pub fn jitter(&self, backoff: Duration) -> Duration {
        if backoff.is_zero() || self.jitter_ratio <= 0.0 {
            return backoff;
        }
        let factor = rand::rng().random_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
        backoff.mul_f64(factor)
    }
}
