//! Exponential backoff schedule for job retries.
//!
//! Failed retriable jobs are re-enqueued with a delay that doubles per
//! attempt: `base * 2^(attempts_made - 1)`. With the default 2 s base and
//! 5 attempts that is 2 s, 4 s, 8 s, 16 s between attempts.
//!
//! The schedule is a pure computation so the queue's retry timing can be
//! asserted in tests without a database.

use std::time::Duration;

/// Backoff parameters for one queue.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    /// Delay before the second attempt; doubles each attempt after that.
    pub base: Duration,

    /// Cap on any single delay, to keep deep retries bounded.
    pub max_delay: Duration,
}

impl BackoffSchedule {
    /// Default schedule: 2 s base, 5 min cap.
    pub const DEFAULT: Self = Self {
        base: Duration::from_millis(2_000),
        max_delay: Duration::from_secs(300),
    };

    /// Computes the delay after `attempts_made` attempts (1-indexed: the
    /// first failure has `attempts_made == 1` and waits exactly `base`).
    pub fn delay_after_attempt(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(32);
        let factor = 2u64.saturating_pow(exponent);
        let delay = self.base.saturating_mul(factor as u32);
        delay.min(self.max_delay)
    }

    /// Returns the delays for attempts `1..=max_attempts`.
    pub fn delays(&self, max_attempts: u32) -> impl Iterator<Item = Duration> + '_ {
        (1..=max_attempts).map(|attempt| self.delay_after_attempt(attempt))
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::DEFAULT
    }
}
