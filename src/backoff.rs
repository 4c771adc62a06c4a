//! Retry timing for reconciliations that failed with a retryable error.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Determines how long to back off before performing a retry.
pub trait BackoffStrategy: Send {
    /// Gets how long to wait before retrying.
    fn next_duration(&mut self) -> Duration;
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(300))
    }
}

impl ExponentialBackoffStrategy {
    /// Start at `base_duration`, doubling up to `cap`.
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            last_duration: Duration::from_secs(0),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

/// One backoff per object key, created on the first failure.
#[derive(Debug, Default)]
pub struct BackoffMap {
    template: ExponentialBackoffStrategy,
    entries: Mutex<HashMap<String, ExponentialBackoffStrategy>>,
}

impl BackoffMap {
    /// Delay before the next retry of `key`.
    pub fn next_duration(&self, key: &str) -> Duration {
        // A poisoned map only means another thread panicked mid-update; the
        // durations in it are still usable.
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| self.template.clone())
            .next_duration()
    }

    /// Forget `key` after a successful pass.
    pub fn reset(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }
}
