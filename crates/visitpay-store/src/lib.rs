//! # visitpay-store
//!
//! **Shared-state plane**: the only state shared across request workers.
//!
//! ## Components
//!
//! 1. **SharedStore**: atomic counter / set-if-absent / compare-and-delete
//!    primitives with TTLs. [`MemoryStore`] is the in-process fallback; a
//!    networked store implements the same trait for horizontal scaling.
//! 2. **IdempotencyLockManager**: short-lived mutual-exclusion leases over a
//!    key, so one logical operation is processed by one worker at a time.
//! 3. **RateLimiter**: fixed-window request budgets per hashed caller
//!    identity.
//!
//! ## Failure Policy
//!
//! Both consumers **fail open**. When the store is unreachable the rate
//! limiter admits the request and the lock manager lets the caller proceed
//! without duplicate suppression. Availability is preferred over strict
//! enforcement; the settlement provider's own idempotency key is the final
//! guard against duplicates.

pub mod lock;
pub mod rate_limiter;
pub mod store;

pub use lock::{IdempotencyLockManager, Lease, LockGrant};
pub use rate_limiter::RateLimiter;
pub use store::{CounterState, MemoryStore, SharedStore};

#[cfg(any(test, feature = "test-helpers"))]
pub use store::OfflineStore;
