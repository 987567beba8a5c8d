//! Bounded exponential backoff.

use std::time::{Duration, Instant};

use crate::config::LockConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout: Duration,
}

impl Backoff {
    #[must_use]
    pub const fn from_config(config: &LockConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            timeout: config.acquire_timeout(),
        }
    }

    /// `base * 2^attempt`, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Sleep before the next attempt, or return `false` once the deadline has
    /// passed.
    pub(crate) fn wait(&self, started: Instant, attempt: u32) -> bool {
        let elapsed = started.elapsed();
        if elapsed >= self.timeout {
            return false;
        }
        let remaining = self.timeout.saturating_sub(elapsed);
        std::thread::sleep(self.delay(attempt).min(remaining));
        true
    }
}
