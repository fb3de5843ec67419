//! # visitpay-settlement
//!
//! **Settlement plane**: turns eligible `(user, place, mission)` completions
//! into captured payments.
//!
//! ## Flow
//!
//! ```text
//!   newly_allowed ─► SettlementQueue::enqueue
//!                         │
//!                         ▼
//!   SettlementWorker ─► lease settle:{key} ─► SettlementProvider::capture
//!                         │                        │
//!                         │ failure                │ success
//!                         ▼                        ▼
//!                  backoff / dead letter    EventSigner ─► EventSink
//! ```
//!
//! ## Guarantees
//!
//! - A job is popped by at most one worker at a time.
//! - Attempts for one job are strictly sequential; the lease is released on
//!   every path.
//! - Retries back off as `min(cap, 2^attempts * base)`; an exhausted job
//!   stays dead-lettered until an operator requeues it.
//! - One job's failure never blocks another.
//!
//! Duplicate suppression is best-effort. The provider's idempotency key is
//! the final guard.

pub mod backoff;
pub mod provider;
pub mod queue;
pub mod settled;
pub mod sink;
pub mod worker;

pub use backoff::{BackoffPolicy, backoff_ms};
pub use provider::{Capture, ScriptedOutcome, SettlementProvider, SimulatedProvider};
pub use queue::{QueueSnapshot, QueueStats, SettlementQueue};
pub use settled::SettledKeys;
pub use sink::{EventSink, LogSink, RecordingSink};
pub use worker::{JobOutcome, SettlementWorker, SkipReason, settlement_lock_key};
