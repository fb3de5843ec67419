//! Fixed-window rate limiter keyed by hashed caller identity.
//!
//! Each `(operation, identity)` pair gets one counter whose TTL is set on the
//! first hit of a window. The raw identity (IP address, device id) is hashed
//! with SHA-256 before it becomes part of a key, so it is never persisted or
//! logged.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use visitpay_types::constants::RATE_LIMIT_PREFIX;
use visitpay_types::{RateLimitRule, RateLimitStatus, Result, VisitpayError};

use crate::store::SharedStore;

/// Per-identity request budgets backed by a [`SharedStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Hex SHA-256 of a raw caller identity.
    #[must_use]
    pub fn hash_identity(raw_identity: &str) -> String {
        hex::encode(Sha256::digest(raw_identity.as_bytes()))
    }

    /// Counter key for an operation and raw identity.
    #[must_use]
    pub fn counter_key(name: &str, raw_identity: &str) -> String {
        format!(
            "{RATE_LIMIT_PREFIX}:{name}:{}",
            Self::hash_identity(raw_identity)
        )
    }

    /// Count this request and report the window state.
    ///
    /// Never fails: if the store is unreachable the request is admitted with
    /// `used = 0` and a full window.
    pub async fn check(
        &self,
        name: &str,
        raw_identity: &str,
        limit: u64,
        window_secs: u64,
    ) -> RateLimitStatus {
        let key = Self::counter_key(name, raw_identity);
        match self.store.incr(&key, Duration::from_secs(window_secs)).await {
            Ok(counter) => {
                let reset_seconds = counter.ttl_remaining_ms.div_ceil(1000).min(window_secs);
                let status = RateLimitStatus::new(limit, counter.count, reset_seconds);
                if status.is_rejected() {
                    debug!(name, key = %key, used = status.used, limit, "rate limit exceeded");
                }
                status
            }
            Err(err) => {
                warn!(name, error = %err, "rate-limit store unreachable, failing open");
                RateLimitStatus::new(limit, 0, window_secs)
            }
        }
    }

    /// [`check`](Self::check) against a configured rule, turning a rejection
    /// into [`VisitpayError::RateLimitExceeded`].
    pub async fn enforce(
        &self,
        name: &str,
        raw_identity: &str,
        rule: RateLimitRule,
    ) -> Result<RateLimitStatus> {
        let status = self
            .check(name, raw_identity, rule.limit, rule.window_secs)
            .await;
        match status.retry_after() {
            Some(retry_after_secs) => Err(VisitpayError::RateLimitExceeded {
                name: name.to_string(),
                retry_after_secs,
            }),
            None => Ok(status),
        }
    }
}
