//! Orchestrator configuration.

use std::time::Duration;

/// Backoff defaults.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const BACKOFF_FACTOR: u32 = 2;
pub const DEFAULT_JITTER: f64 = 0.2;

/// Exponential backoff with jitter between run attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound of any single delay.
    pub max: Duration,
    /// Growth factor per retry.
    pub factor: u32,
    /// Relative jitter in `[0, 1)`; 0.2 spreads a delay over ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: INITIAL_BACKOFF,
            max: MAX_BACKOFF,
            factor: BACKOFF_FACTOR,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately.
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let mut delay = self.initial.min(self.max);
        for _ in 1..retry {
            delay = self.next(delay);
        }
        delay
    }

    fn next(&self, current: Duration) -> Duration {
        let next = current.saturating_mul(self.factor);
        if next > self.max {
            self.max
        } else {
            next
        }
    }

    /// Jittered delay before retry `retry`, never longer than `remaining`.
    pub fn delay(&self, retry: u32, remaining: Duration) -> Duration {
        let base = self.base_delay(retry);
        let delay = if self.jitter > 0.0 {
            let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
            base.mul_f64((1.0 + spread).max(0.0))
        } else {
            base
        };
        delay.min(self.max).min(remaining)
    }
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Delay policy between attempts of one task.
    pub backoff: BackoffPolicy,

    /// Run analysis tasks one after another instead of concurrently.
    pub sequential: bool,
}

impl PipelineConfig {
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(5));
        assert_eq!(policy.base_delay(2), Duration::from_secs(10));
        assert_eq!(policy.base_delay(3), Duration::from_secs(20));
        assert_eq!(policy.base_delay(4), Duration::from_secs(30));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_stays_within_jitter_band() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(2, Duration::from_secs(600));
            assert!(delay >= Duration::from_secs(8), "{:?}", delay);
            assert!(delay <= Duration::from_secs(12), "{:?}", delay);
        }
    }

    #[test]
    fn test_delay_clamped_to_remaining_budget() {
        let policy = BackoffPolicy::default();
        for retry in 1..6 {
            assert!(policy.delay(retry, Duration::from_secs(3)) <= Duration::from_secs(3));
        }
        assert_eq!(policy.delay(1, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_immediate() {
        assert_eq!(BackoffPolicy::immediate().delay(3, Duration::from_secs(60)), Duration::ZERO);
    }
}
