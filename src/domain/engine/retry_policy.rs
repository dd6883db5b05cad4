use rand::Rng;
use std::time::Duration;

/// Share of the computed delay added as random jitter, in percent.
const JITTER_PERCENT: u64 = 20;

/// Exponential backoff between transient retries of the same candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy { initial: Duration::from_millis(250), max: Duration::from_millis(2000) }
    }
}

impl BackoffPolicy {
    /// `max` is raised to `initial` if it is smaller.
    pub fn new(initial: Duration, max: Duration) -> Self {
        BackoffPolicy { initial, max: max.max(initial) }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// [`Self::base_delay`] plus up to 20% random jitter, still capped at `max`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter_cap_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX) * JITTER_PERCENT / 100;
        let jitter = if jitter_cap_ms == 0 { 0 } else { rand::rng().random_range(0..=jitter_cap_ms) };

        base.saturating_add(Duration::from_millis(jitter)).min(self.max)
    }
}
