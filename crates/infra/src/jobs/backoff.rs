//! Retry backoff policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay before the first retry.
pub const BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Upper bound for any single retry delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(60 * 60);

/// Exponential backoff parameters: `min(max_delay, base_delay * 2^(attempt-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: BACKOFF_BASE,
            max_delay: BACKOFF_CAP,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Clamp the exponent so the shift stays in range.
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Instant of the next attempt after `attempts` failures, measured from `now`.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Default backoff: one minute doubling per attempt, capped at one hour.
pub fn compute_backoff(attempts: u32) -> Duration {
    RetryPolicy::default().delay_for_attempt(attempts)
}
