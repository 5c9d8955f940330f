//! Reconnect backoff for long-running chain tasks

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;

/// Exponential backoff that never gives up
///
/// Watchers must keep trying, so there is no elapsed-time limit; the delay is capped
/// at `max_retry_delay_ms` instead.
pub struct RetryPolicy {
    inner: ExponentialBackoff,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max_delay: Duration) -> Self {
        let inner = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            max_interval: max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };
        Self { inner, max_delay }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.inner.next_backoff().unwrap_or(self.max_delay)
    }

    /// Start over after a successful attempt
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}
