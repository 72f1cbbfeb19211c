//! Shared exponential backoff arithmetic.
//!
//! Start retries, recovery windows and verification polling all derive their
//! delays from [`backoff_delay`] so the three schedules stay consistent.

use std::time::Duration;

/// First poll interval right after a process is spawned
pub const POLL_BASE: Duration = Duration::from_millis(100);

/// Slowest poll interval while waiting for a service to become healthy
pub const POLL_CAP: Duration = Duration::from_secs(2);

/// `min(base * 2^attempt, cap)`, saturating instead of overflowing
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(Duration::MAX).min(cap)
}

/// Delay before the `poll`-th health poll of a freshly spawned process
pub fn poll_interval(poll: u32) -> Duration {
    backoff_delay(poll, POLL_BASE, POLL_CAP)
}

/// Retry configuration for one service start
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of start attempts
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub delay_cap: Duration,
    /// How long a spawned process gets to answer its health check
    pub verify_timeout: Duration,
    /// How long to keep probing after a bind conflict before giving up
    pub bind_conflict_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            delay_cap: Duration::from_secs(10),
            verify_timeout: Duration::from_secs(30),
            bind_conflict_grace: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before `attempt`; the first attempt never waits
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            backoff_delay(attempt, self.base_delay, self.delay_cap)
        }
    }
}
