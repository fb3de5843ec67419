//! Bounded exponential backoff.

use visitpay_types::SettlementConfig;
use visitpay_types::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS};

/// `min(cap, 2^attempts * base)`, saturating instead of overflowing.
#[must_use]
pub fn backoff_ms(attempts: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

/// Backoff parameters taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: BACKOFF_BASE_MS,
            cap_ms: BACKOFF_CAP_MS,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            cap_ms: config.backoff_cap_ms,
        }
    }

    /// Delay before the next attempt, given the failures so far.
    #[must_use]
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        backoff_ms(attempts, self.base_ms, self.cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000];
        for (attempts, want) in (0u32..=6).zip(expected) {
            assert_eq!(backoff_ms(attempts, 1_000, 60_000), want, "attempts={attempts}");
        }
    }

    #[test]
    fn monotone_and_bounded() {
        let policy = BackoffPolicy::default();
        let mut prev = 0;
        for attempts in 0..100 {
            let d = policy.delay_ms(attempts);
            assert!(d >= prev);
            assert!(d <= BACKOFF_CAP_MS);
            prev = d;
        }
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        assert_eq!(backoff_ms(64, 1_000, 60_000), 60_000);
        assert_eq!(backoff_ms(u32::MAX, 1_000, u64::MAX), u64::MAX);
    }
}
