//! Throttled logging for repetitive failures.
//!
//! A key that keeps failing is logged on every occurrence up to `base`, then
//! on every `base`-th occurrence up to `base^2`, and so on. Suppressed records
//! are accounted for in a `[showing 1/N messages]` suffix.

use crate::config::QueueConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use tracing::{error, info, warn, Level};

/// Per-key exponentially decaying logger.
#[derive(Debug)]
pub struct ThrottledLogger {
    base: u64,
    counts: Mutex<HashMap<String, u64>>,
}

impl Default for ThrottledLogger {
    fn default() -> Self {
        Self::new(QueueConfig::THROTTLED_LOG_BASE)
    }
}

impl ThrottledLogger {
    pub fn new(base: u64) -> Self {
        Self {
            base: base.max(2),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Count one occurrence of `key`. Returns the current sampling interval if
    /// this occurrence should be emitted.
    pub fn record(&self, key: &str) -> Option<u64> {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        emit_interval(*count, self.base)
    }

    /// Forget the history of `key`.
    pub fn reset(&self, key: &str) {
        self.counts.lock().remove(key);
    }

    pub fn log(&self, level: Level, key: &str, message: impl Display) {
        let Some(interval) = self.record(key) else {
            return;
        };
        let suffix = if interval > 1 {
            format!(" [showing 1/{} messages]", interval)
        } else {
            String::new()
        };
        if level == Level::ERROR {
            error!("{}{}", message, suffix);
        } else if level == Level::WARN {
            warn!("{}{}", message, suffix);
        } else {
            info!("{}{}", message, suffix);
        }
    }

    pub fn warn(&self, key: &str, message: impl Display) {
        self.log(Level::WARN, key, message);
    }

    pub fn error(&self, key: &str, message: impl Display) {
        self.log(Level::ERROR, key, message);
    }
}

/// Largest power of `base` not exceeding `count`, if `count` is a multiple of it.
fn emit_interval(count: u64, base: u64) -> Option<u64> {
    if count == 0 {
        return None;
    }
    let mut interval = 1u64;
    while let Some(next) = interval.checked_mul(base) {
        if next > count {
            break;
        }
        interval = next;
    }
    (count % interval == 0).then_some(interval)
}

/// In-memory log sink for tests. Records from every task polled on the
/// installing thread land in the buffer while the guard is alive.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    buffer: std::sync::Arc<Mutex<Vec<u8>>>,
}

#[cfg(test)]
impl CapturedLogs {
    pub(crate) fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let logs = Self::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .with_writer(move || writer.clone())
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

#[cfg(test)]
impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
