//! Reconnect policy: decides how often and how long to retry a connection.

use std::time::Duration;

/// Retry policy for the queue transport connection.
///
/// `max_attempts` bounds the startup connect; background reconnection after
/// a connection loss is bounded by `max_reconnect_attempts` (None = retry
/// until shutdown).
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated at startup before giving up.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub retry_delay: Duration,

    /// Backoff multiplier. 1.0 keeps the delay constant.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    pub max_reconnect_attempts: Option<u32>,

    /// How long a publish waits for a fresh channel while reconnecting.
    pub publish_wait: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_secs(3),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
            publish_wait: Duration::from_secs(6),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            retry_delay,
            publish_wait: retry_delay * 2,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    pub fn with_publish_wait(mut self, wait: Duration) -> Self {
        self.publish_wait = wait;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-indexed).
    ///
    /// delay = retry_delay * multiplier^(attempt - 1), capped at `max_delay`.
    ///
    /// Example with retry_delay=1s, multiplier=2.0, max_delay=5s:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    /// - attempt 4: 5s (capped)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.retry_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }
}
