//! Progressive per-attempt timeout policy.

use std::time::Duration;

/// `timeout_i = min(base + step * i, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub step: Duration,
    pub cap: Duration,
}

impl TimeoutPolicy {
    pub fn new(base: Duration, step: Duration, cap: Duration) -> Self {
        Self { base, step, cap }
    }

    /// Timeout for the 0-based attempt `index`. Non-decreasing in `index` and never above `cap`.
    pub fn timeout_for(&self, index: u32) -> Duration {
        self.base
            .saturating_add(self.step.saturating_mul(index))
            .min(self.cap)
    }
}
