//! Rate-limit response contract.

use serde::{Deserialize, Serialize};

/// Counter state reported for every rate-limited operation. The boundary
/// layer surfaces these as response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    /// Requests counted in the current window, including this one.
    pub used: u64,
    /// `limit - used`; negative means this request is rejected.
    pub remaining: i64,
    /// Seconds until the window resets; doubles as retry-after.
    pub reset_seconds: u64,
}

impl RateLimitStatus {
    #[must_use]
    pub fn new(limit: u64, used: u64, reset_seconds: u64) -> Self {
        let remaining = i64::try_from(limit)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(used).unwrap_or(i64::MAX));
        Self {
            limit,
            used,
            remaining,
            reset_seconds,
        }
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.remaining < 0
    }

    /// Retry-after hint in seconds, present only on rejection.
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        self.is_rejected().then_some(self.reset_seconds)
    }
}
