//! Idempotency lock manager.
//!
//! A lease marks "someone is processing this key right now". Losing the race
//! for a lease is a normal outcome, never an error: the holder is assumed to
//! be making progress.
//!
//! Two flavors are offered:
//!
//! - [`IdempotencyLockManager::try_lock`] / [`IdempotencyLockManager::unlock`]:
//!   bare leases; `unlock` deletes unconditionally, so callers must only
//!   unlock keys they locked.
//! - [`IdempotencyLockManager::try_acquire`] / [`IdempotencyLockManager::release`]:
//!   each lease carries a random token and release is compare-and-delete, so
//!   a caller whose lease already expired cannot free a successor's lease.
//!
//! Leases are a best-effort duplicate suppressor. A crash mid-operation
//! leaves the lease to expire by TTL, after which a duplicate attempt is
//! possible and must be absorbed downstream.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use visitpay_types::Clock;

use crate::store::SharedStore;

/// Value stored under bare leases.
const BARE_LEASE_VALUE: &str = "1";

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    /// Random ownership token required to release.
    pub token: String,
    pub expires_at_ms: u64,
}

/// Result of a token-lease acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockGrant {
    /// The caller owns the lease until release or expiry.
    Acquired(Lease),
    /// A live lease exists; someone else is processing this key.
    Contended,
    /// The store is unreachable; proceed without duplicate suppression.
    Unguarded,
}

impl LockGrant {
    /// Whether the caller may go ahead with the guarded work.
    #[must_use]
    pub fn may_proceed(&self) -> bool {
        !matches!(self, Self::Contended)
    }
}

/// Grants mutual-exclusion leases backed by a [`SharedStore`].
#[derive(Clone)]
pub struct IdempotencyLockManager {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyLockManager {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create the lease only if absent. Returns `false` if a live lease
    /// exists. Store failures skip the check and return `true`.
    pub async fn try_lock(&self, key: &str, ttl_ms: u64) -> bool {
        match self
            .store
            .set_nx(key, BARE_LEASE_VALUE, Duration::from_millis(ttl_ms))
            .await
        {
            Ok(acquired) => {
                if !acquired {
                    debug!(key, "lease held elsewhere");
                }
                acquired
            }
            Err(err) => {
                warn!(key, error = %err, "lock store unreachable, proceeding unguarded");
                true
            }
        }
    }

    /// Delete the lease unconditionally.
    pub async fn unlock(&self, key: &str) {
        if let Err(err) = self.store.delete(key).await {
            warn!(key, error = %err, "failed to delete lease, leaving it to expire");
        }
    }

    /// Acquire a token-bearing lease.
    pub async fn try_acquire(&self, key: &str, ttl_ms: u64) -> LockGrant {
        let token = hex::encode(rand::random::<[u8; 16]>());
        let expires_at_ms = self.clock.now_ms().saturating_add(ttl_ms);
        match self
            .store
            .set_nx(key, &token, Duration::from_millis(ttl_ms))
            .await
        {
            Ok(true) => LockGrant::Acquired(Lease {
                key: key.to_string(),
                token,
                expires_at_ms,
            }),
            Ok(false) => {
                debug!(key, "lease held elsewhere");
                LockGrant::Contended
            }
            Err(err) => {
                warn!(key, error = %err, "lock store unreachable, proceeding unguarded");
                LockGrant::Unguarded
            }
        }
    }

    /// Release a lease only if it is still ours. Returns whether it was
    /// deleted; `false` means it already expired or changed hands.
    pub async fn release(&self, lease: &Lease) -> bool {
        match self.store.compare_and_delete(&lease.key, &lease.token).await {
            Ok(released) => {
                if !released {
                    warn!(key = %lease.key, "lease expired before release");
                }
                released
            }
            Err(err) => {
                warn!(key = %lease.key, error = %err, "failed to release lease, leaving it to expire");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, OfflineStore};
    use visitpay_types::ManualClock;

    fn manager() -> (Arc<ManualClock>, IdempotencyLockManager) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (clock.clone(), IdempotencyLockManager::new(store, clock))
    }

    #[tokio::test]
    async fn concurrent_try_lock_single_winner() {
        let (_clock, locks) = manager();
        let (a, b) = tokio::join!(
            locks.try_lock("settle:k1", 60_000),
            locks.try_lock("settle:k1", 60_000)
        );
        assert!(a ^ b, "exactly one caller must win: a={a} b={b}");
    }

    #[tokio::test]
    async fn parallel_tasks_single_winner() {
        let (_clock, locks) = manager();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.try_lock("settle:race", 60_000).await
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn unlock_allows_relock() {
        let (_clock, locks) = manager();
        assert!(locks.try_lock("k", 60_000).await);
        assert!(!locks.try_lock("k", 60_000).await);
        locks.unlock("k").await;
        assert!(locks.try_lock("k", 60_000).await);
    }

    #[tokio::test]
    async fn ttl_expiry_allows_relock() {
        let (clock, locks) = manager();
        assert!(locks.try_lock("k", 1_000).await);
        clock.advance(999);
        assert!(!locks.try_lock("k", 1_000).await);
        clock.advance(1);
        assert!(locks.try_lock("k", 1_000).await);
    }

    #[tokio::test]
    async fn different_keys_independent() {
        let (_clock, locks) = manager();
        assert!(locks.try_lock("a", 60_000).await);
        assert!(locks.try_lock("b", 60_000).await);
    }

    #[tokio::test]
    async fn token_lease_release_requires_ownership() {
        let (clock, locks) = manager();
        let LockGrant::Acquired(first) = locks.try_acquire("k", 1_000).await else {
            panic!("first acquire must succeed");
        };
        assert_eq!(first.expires_at_ms, 1_000);
        assert_eq!(locks.try_acquire("k", 1_000).await, LockGrant::Contended);

        // The first holder stalls past its TTL; a second worker takes over.
        clock.advance(1_000);
        let LockGrant::Acquired(second) = locks.try_acquire("k", 1_000).await else {
            panic!("acquire after expiry must succeed");
        };
        assert_ne!(first.token, second.token);

        // The stale holder cannot free the successor's lease.
        assert!(!locks.release(&first).await);
        assert_eq!(locks.try_acquire("k", 1_000).await, LockGrant::Contended);

        assert!(locks.release(&second).await);
        assert!(locks.try_acquire("k", 1_000).await.may_proceed());
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let clock = Arc::new(ManualClock::new(0));
        let locks = IdempotencyLockManager::new(Arc::new(OfflineStore), clock);
        assert!(locks.try_lock("k", 1_000).await);
        assert_eq!(locks.try_acquire("k", 1_000).await, LockGrant::Unguarded);
        assert!(LockGrant::Unguarded.may_proceed());
        locks.unlock("k").await;
    }
}
