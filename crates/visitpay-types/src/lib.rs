//! # visitpay-types
//!
//! Shared types, errors, and configuration for the **VisitPay**
//! verification-and-settlement pipeline.
//!
//! This crate is the leaf dependency of the workspace. Every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`UserId`], [`PlaceId`], [`MissionId`], [`JobId`]
//! - **Proof tokens**: [`ProofToken`], [`TokenCheck`]
//! - **Scan model**: [`ScanRead`], [`ConsensusResult`]
//! - **Location model**: [`GeoPoint`], [`Geofence`], [`LocationSample`], [`GeofenceOutcome`]
//! - **Verification model**: [`VerificationRecord`], [`Eligibility`], [`EligibilityPolicy`], [`InboundEvent`]
//! - **Job model**: [`SettlementJob`], [`JobPayload`], [`SettlementPayload`], [`DeadLetter`]
//! - **Settlement events**: [`SettlementEvent`]
//! - **Rate limiting**: [`RateLimitStatus`]
//! - **Time**: [`Clock`], [`SystemClock`], [`ManualClock`]
//! - **Configuration**: [`VisitpayConfig`] and its sections
//! - **Errors**: [`VisitpayError`] with `VP_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod geo;
pub mod ids;
pub mod job;
pub mod rate_limit;
pub mod scan;
pub mod token;
pub mod verification;

// Re-export all primary types at crate root for ergonomic imports:
//   use visitpay_types::{ProofToken, SettlementJob, Geofence, ...};

pub use clock::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use geo::*;
pub use ids::*;
pub use job::*;
pub use rate_limit::*;
pub use scan::*;
pub use token::*;
pub use verification::*;

// Constants are accessed via `visitpay_types::constants::FOO`
// (not re-exported to avoid name collisions).
