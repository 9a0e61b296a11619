//! Bounded exponential backoff for bus reconnects.

use std::time::Duration;

/// Delay before attempt `n` (1-based) is `base * 2^(n-1)`; with the default
/// 2s base that is 2s, 4s, 8s, 16s, 32s. After `max_attempts` there is no
/// further delay and the caller gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(2), max_attempts: 5 }
    }
}

impl BackoffPolicy {
    pub const fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    pub const fn max_attempts(&self) -> u32 { self.max_attempts }

    /// `None` once `attempt` is past the bound.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }

    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).filter_map(|n| self.delay(n)).collect()
    }
}
