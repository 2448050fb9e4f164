use crate::options::SlowDownConfig;
use std::time::Duration;

/// Outcome of the slow-down calculation for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub count: i64,
    pub delay: Duration,
    pub remaining: u64,
}

impl ThrottleDecision {
    pub fn new(count: i64, config: &SlowDownConfig) -> Self {
        Self {
            count,
            delay: calculate_delay(count, config),
            remaining: remaining(count, config.threshold),
        }
    }

    pub fn delay_ms(&self) -> u64 {
        duration_millis(self.delay)
    }
}

/// Delay for the `count`-th request in the current window.
///
/// Zero up to and including the threshold, then one `unit_delay` per
/// request over it, capped at `max_delay`.
pub fn calculate_delay(count: i64, config: &SlowDownConfig) -> Duration {
    if config.delaying_disabled() {
        return Duration::ZERO;
    }

    let threshold = i64::from(config.threshold);
    if count <= threshold {
        return Duration::ZERO;
    }

    let excess = u32::try_from(count - threshold).unwrap_or(u32::MAX);
    config
        .unit_delay
        .saturating_mul(excess)
        .min(config.max_delay)
}

/// Requests left before delaying starts, clamped at zero.
pub fn remaining(count: i64, threshold: u32) -> u64 {
    u64::try_from(i64::from(threshold).saturating_sub(count)).unwrap_or(0)
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
