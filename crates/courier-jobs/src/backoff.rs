//! Exponential retry backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_core::defaults;

/// Bounded exponential backoff: `delay(n) = min(cap, base * 2^n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_secs(defaults::JOB_BACKOFF_BASE_SECS, defaults::JOB_BACKOFF_CAP_SECS)
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_secs(base_secs: u64, cap_secs: u64) -> Self {
        Self::new(Duration::from_secs(base_secs), Duration::from_secs(cap_secs))
    }

    /// Delay before the next attempt of a job that has consumed `attempts`.
    ///
    /// Negative counts are treated as zero. Saturates instead of overflowing.
    pub fn delay(&self, attempts: i32) -> Duration {
        let exp = attempts.max(0) as u32;
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.cap)
    }

    /// `now + delay(attempts)`, clamped to the latest representable instant.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(attempts))
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
