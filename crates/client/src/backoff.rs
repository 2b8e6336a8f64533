// Exponential backoff shared by registry retries and live reconnects.

use std::time::Duration;

/// Retry parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Registry calls: a handful of quick retries before blocking the mount.
    pub fn registry() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            max_attempts: 5,
        }
    }

    /// Live socket: retry indefinitely.
    pub fn reconnect() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: u32::MAX,
        }
    }

    /// Delay before retry number `attempt` (0-based): base doubled per attempt, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}
