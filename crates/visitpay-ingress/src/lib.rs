//! # visitpay-ingress
//!
//! **Verification plane**: turns raw client submissions into verification
//! flags.
//!
//! ## Pipeline
//!
//! ```text
//!  QR frames ──► ConsensusValidator ──► Signer::check ──┐
//!  location  ──► geofence::evaluate ────────────────────┼──► VerificationAggregator
//!  receipt   ───────────────────────────────────────────┘        │
//!                                                                ▼
//!                                                   allowed = gps && (qr || receipt)
//! ```
//!
//! ## Components
//!
//! 1. **Signer / EventSigner**: HMAC-SHA256 proof tokens and settlement
//!    event signatures, compared in constant time.
//! 2. **ConsensusValidator**: multi-frame agreement over a bounded buffer,
//!    with a noise-adaptive threshold.
//! 3. **geofence**: haversine distance plus accuracy gating.
//! 4. **VerificationAggregator**: atomic per-flag upserts and derived
//!    eligibility, reporting the first transition into `allowed`.
//! 5. **VerificationService**: rate-limited submission paths tying the above
//!    together.

pub mod aggregator;
pub mod consensus;
pub mod geofence;
pub mod service;
pub mod signer;

pub use aggregator::{
    FlagUpdate, InMemoryVerificationStore, RecordOutcome, VerificationAggregator,
    VerificationStore,
};
pub use consensus::{ConsensusValidator, NoiseTracker, ScanSession, adaptive_threshold};
pub use geofence::haversine_meters;
pub use service::{VerificationFailure, VerificationReport, VerificationService};
pub use signer::{EventSigner, Signer};
