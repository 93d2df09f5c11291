//! Redial delay policy: exponential growth, capped, with full jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::HubConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_retries,
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap, config.max_retries)
    }

    /// Upper bound of the delay before retry number `attempt` (1-based):
    /// `min(cap, base * 2^(attempt - 1))`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// A uniformly random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let b = Backoff::default();
        assert_eq!(b.ceiling(1), Duration::from_secs(1));
        assert_eq!(b.ceiling(2), Duration::from_secs(2));
        assert_eq!(b.ceiling(3), Duration::from_secs(4));
        assert_eq!(b.ceiling(6), Duration::from_secs(32));
        assert_eq!(b.ceiling(7), Duration::from_secs(60));
        assert_eq!(b.ceiling(40), Duration::from_secs(60));
        assert_eq!(b.ceiling(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_millis(80), 5);
        for attempt in 1..10 {
            for _ in 0..50 {
                assert!(b.delay(attempt) <= b.ceiling(attempt));
            }
        }
    }

    #[test]
    fn test_exhausted() {
        let b = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3);
        assert!(!b.exhausted(3));
        assert!(b.exhausted(4));
    }

    #[test]
    fn test_cap_below_base_is_raised() {
        let b = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 1);
        assert_eq!(b.ceiling(1), Duration::from_secs(5));
        assert_eq!(b.ceiling(4), Duration::from_secs(5));
    }
}
