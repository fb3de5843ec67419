//! Submission front door.
//!
//! Wires the signer, consensus validator, geofence, and aggregator into the
//! three submission paths a client drives:
//!
//! ```text
//!   scan read ──► consensus ──► decode + check token ──► place match ──► QR flag
//!   location  ──► geofence  ─────────────────────────────────────────► GPS flag
//!   receipt   ──► (checked upstream) ────────────────────────────────► RECEIPT flag
//! ```
//!
//! Every path ends in a [`VerificationReport`]. A failed check is a normal
//! report with `passed = false`; only infrastructure faults and rate-limit
//! rejections surface as errors.
//!
//! Scan sessions live only as long as their reads can still count: a session
//! idle for longer than the consensus window is swept, and the number of
//! open sessions is capped, evicting the least recently touched.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, info};
use visitpay_store::RateLimiter;
use visitpay_types::constants::MAX_SCAN_SESSIONS;
use visitpay_types::{
    Clock, ConsensusResult, Eligibility, GeofenceOutcome, GeofenceRejection, Geofence, InboundEvent,
    InboundKind, LocationSample, MissionId, PlaceId, ProofToken, RateLimitConfig, Result,
    ScanRead, TokenCheck, UserId, VerificationFlag,
};

use crate::aggregator::{RecordOutcome, VerificationAggregator};
use crate::consensus::{ConsensusValidator, ScanSession};
use crate::geofence;
use crate::signer::Signer;

/// Rate-limit rule names.
pub mod limits {
    pub const ISSUE_TOKEN: &str = "issue_token";
    pub const SCAN: &str = "scan";
    pub const LOCATION: &str = "location";
    pub const RECEIPT: &str = "receipt";
}

/// Why a submission did not set its flag.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationFailure {
    /// Not enough consecutive matching reads yet. Keep scanning.
    ConsensusPending { consecutive_matches: u32, threshold: u32 },
    /// The scanned token did not check out.
    Token(TokenCheck),
    /// A valid token for a different place.
    WrongPlace { expected: PlaceId, found: PlaceId },
    Geofence(GeofenceRejection),
    ReceiptRejected,
}

/// Outcome of one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub flag: VerificationFlag,
    pub passed: bool,
    pub failure: Option<VerificationFailure>,
    /// Mission carried by a verified proof token.
    pub mission_id: Option<MissionId>,
    pub consensus: Option<ConsensusResult>,
    pub geofence: Option<GeofenceOutcome>,
    pub eligibility: Eligibility,
    /// Set on the submission that first made the pair eligible.
    pub newly_allowed: bool,
}

impl VerificationReport {
    fn new(flag: VerificationFlag, eligibility: Eligibility) -> Self {
        Self {
            flag,
            passed: false,
            failure: None,
            mission_id: None,
            consensus: None,
            geofence: None,
            eligibility,
            newly_allowed: false,
        }
    }

    fn passed(mut self, outcome: RecordOutcome) -> Self {
        self.passed = true;
        self.eligibility = outcome.eligibility;
        self.newly_allowed = outcome.newly_allowed;
        self
    }

    fn failed(mut self, failure: VerificationFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// A scan buffer plus the server time it was last fed.
struct OpenSession {
    session: ScanSession,
    touched_ms: u64,
}

/// Verification entry point shared by all request handlers.
pub struct VerificationService {
    signer: Signer,
    consensus: ConsensusValidator,
    aggregator: VerificationAggregator,
    limiter: RateLimiter,
    limits: RateLimitConfig,
    clock: Arc<dyn Clock>,
    sessions: DashMap<(UserId, PlaceId), OpenSession>,
    max_sessions: usize,
    last_sweep_ms: AtomicU64,
}

impl VerificationService {
    #[must_use]
    pub fn new(
        signer: Signer,
        consensus: ConsensusValidator,
        aggregator: VerificationAggregator,
        limiter: RateLimiter,
        limits: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            signer,
            consensus,
            aggregator,
            limiter,
            limits,
            clock,
            sessions: DashMap::new(),
            max_sessions: MAX_SCAN_SESSIONS,
            last_sweep_ms: AtomicU64::new(now),
        }
    }

    /// Cap on concurrently open scan sessions. Clamped to at least one.
    #[must_use]
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    #[must_use]
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    #[must_use]
    pub fn aggregator(&self) -> &VerificationAggregator {
        &self.aggregator
    }

    /// Apply the named budget to `caller`. Unconfigured names are unlimited.
    async fn enforce(&self, name: &str, caller: &str) -> Result<()> {
        if let Some(rule) = self.limits.rule(name) {
            self.limiter.enforce(name, caller, rule).await?;
        }
        Ok(())
    }

    /// Issue a proof token for display at a place.
    pub async fn issue_token(
        &self,
        caller: &str,
        place_id: PlaceId,
        mission_id: MissionId,
    ) -> Result<ProofToken> {
        self.enforce(limits::ISSUE_TOKEN, caller).await?;
        self.signer.issue(place_id, mission_id)
    }

    /// Feed one scanner read into the `(user, place)` session.
    ///
    /// Every frame is charged to the scan budget before it touches any
    /// session state.
    pub async fn submit_scan(
        &self,
        caller: &str,
        user_id: &UserId,
        place_id: &PlaceId,
        read: ScanRead,
    ) -> Result<VerificationReport> {
        self.enforce(limits::SCAN, caller).await?;

        let now = self.clock.now_ms();
        self.maybe_sweep(now);
        let key = (user_id.clone(), place_id.clone());
        if !self.sessions.contains_key(&key) {
            self.make_room();
        }

        let raw_text = read.text.clone();
        let consensus = {
            let mut open = self.sessions.entry(key).or_insert_with(|| OpenSession {
                session: self.consensus.new_session(),
                touched_ms: now,
            });
            open.touched_ms = now;
            self.consensus.observe(&mut open.session, read)
        };

        let mut report = VerificationReport::new(VerificationFlag::Qr, Eligibility::default());
        report.consensus = Some(consensus);
        if !consensus.valid {
            report.eligibility = self.aggregator.get_eligibility(user_id, place_id).await?;
            return Ok(report.failed(VerificationFailure::ConsensusPending {
                consecutive_matches: consensus.consecutive_matches,
                threshold: consensus.threshold_used,
            }));
        }
        self.sessions.remove(&(user_id.clone(), place_id.clone()));

        let failure = match ProofToken::decode(&raw_text) {
            None => Some(VerificationFailure::Token(TokenCheck::Malformed)),
            Some(token) => {
                let check = self.signer.check(&token);
                report.mission_id = Some(token.mission_id.clone());
                if !check.is_valid() {
                    Some(VerificationFailure::Token(check))
                } else if token.place_id != *place_id {
                    Some(VerificationFailure::WrongPlace {
                        expected: place_id.clone(),
                        found: token.place_id,
                    })
                } else {
                    None
                }
            }
        };

        if let Some(failure) = failure {
            debug!(user = %user_id, place = %place_id, ?failure, "scan rejected");
            report.mission_id = None;
            report.eligibility = self.aggregator.get_eligibility(user_id, place_id).await?;
            return Ok(report.failed(failure));
        }

        let outcome = self.aggregator.record_qr(user_id, place_id, true).await?;
        info!(user = %user_id, place = %place_id, "proof token verified");
        Ok(report.passed(outcome))
    }

    /// Evaluate a location sample against the place's fence.
    pub async fn submit_location(
        &self,
        caller: &str,
        user_id: &UserId,
        place_id: &PlaceId,
        sample: &LocationSample,
        fence: &Geofence,
    ) -> Result<VerificationReport> {
        self.enforce(limits::LOCATION, caller).await?;
        let outcome = geofence::evaluate(sample, fence);

        let mut report = VerificationReport::new(VerificationFlag::Gps, Eligibility::default());
        report.geofence = Some(outcome);
        match outcome.rejection {
            Some(rejection) => {
                debug!(
                    user = %user_id,
                    place = %place_id,
                    distance = outcome.distance_meters,
                    ?rejection,
                    "location rejected"
                );
                report.eligibility = self.aggregator.get_eligibility(user_id, place_id).await?;
                Ok(report.failed(VerificationFailure::Geofence(rejection)))
            }
            None => {
                let recorded = self.aggregator.record_gps(user_id, place_id, true).await?;
                Ok(report.passed(recorded))
            }
        }
    }

    /// Record a receipt decision made upstream.
    pub async fn submit_receipt(
        &self,
        caller: &str,
        user_id: &UserId,
        place_id: &PlaceId,
        accepted: bool,
    ) -> Result<VerificationReport> {
        self.enforce(limits::RECEIPT, caller).await?;
        let report = VerificationReport::new(VerificationFlag::Receipt, Eligibility::default());
        if !accepted {
            let mut report = report.failed(VerificationFailure::ReceiptRejected);
            report.eligibility = self.aggregator.get_eligibility(user_id, place_id).await?;
            return Ok(report);
        }
        let recorded = self
            .aggregator
            .record_receipt(user_id, place_id, true)
            .await?;
        Ok(report.passed(recorded))
    }

    /// Dispatch a routed inbound event. `fence` is the fence of
    /// `event.place_id`, looked up by the caller.
    pub async fn handle(
        &self,
        caller: &str,
        event: InboundEvent,
        fence: &Geofence,
    ) -> Result<VerificationReport> {
        let InboundEvent {
            user_id,
            place_id,
            kind,
            timestamp_ms,
            source_tag,
        } = event;
        match kind {
            InboundKind::Scan { raw_text } => {
                let read = ScanRead::new(raw_text, timestamp_ms, source_tag);
                self.submit_scan(caller, &user_id, &place_id, read).await
            }
            InboundKind::Location { coords, accuracy } => {
                let sample = LocationSample::new(coords.lat, coords.lng, accuracy);
                self.submit_location(caller, &user_id, &place_id, &sample, fence)
                    .await
            }
            InboundKind::Receipt {
                receipt_id,
                accepted,
            } => {
                debug!(user = %user_id, receipt = %receipt_id, accepted, "receipt submitted");
                self.submit_receipt(caller, &user_id, &place_id, accepted)
                    .await
            }
        }
    }

    /// Drop the scan buffer for a pair, e.g. when the scanner view closes.
    pub fn end_session(&self, user_id: &UserId, place_id: &PlaceId) {
        self.sessions.remove(&(user_id.clone(), place_id.clone()));
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions not fed within the consensus window. Returns how many
    /// were dropped.
    pub fn sweep_idle_sessions(&self) -> usize {
        let now = self.clock.now_ms();
        self.last_sweep_ms.store(now, Ordering::Relaxed);
        self.sweep_before(now.saturating_sub(self.consensus.window_ms()))
    }

    /// Sweep at most once per consensus window.
    fn maybe_sweep(&self, now: u64) {
        let window = self.consensus.window_ms();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < window {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep_before(now.saturating_sub(window));
        }
    }

    fn sweep_before(&self, cutoff_ms: u64) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, open| open.touched_ms >= cutoff_ms);
        let dropped = before.saturating_sub(self.sessions.len());
        if dropped > 0 {
            debug!(dropped, open = self.sessions.len(), "idle scan sessions swept");
        }
        dropped
    }

    /// Evict least recently touched sessions until one more fits.
    fn make_room(&self) {
        while self.sessions.len() >= self.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|entry| entry.value().touched_ms)
                .map(|entry| entry.key().clone());
            let Some(key) = oldest else {
                break;
            };
            self.sessions.remove(&key);
            debug!(user = %key.0, place = %key.1, "scan session evicted at capacity");
        }
    }
}
