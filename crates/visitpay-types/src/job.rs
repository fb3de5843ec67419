//! # Settlement jobs
//!
//! A job is created when a `(user, place)` pair first becomes eligible and is
//! owned exclusively by the settlement queue from then on.
//!
//! ## State Machine
//!
//! ```text
//!   ┌───────┐  pop   ┌──────────┐ provider ok ┌───────────┐
//!   │ READY ├───────▶│ IN_FLIGHT├────────────▶│ SUCCEEDED │ (removed)
//!   └───▲───┘        └────┬─────┘             └───────────┘
//!       │ due             │ provider error
//!   ┌───┴──────┐          │ attempts < max
//!   │ RETRYING │◀─────────┤
//!   └──────────┘          │ attempts == max
//!                    ┌────▼──────────┐
//!                    │ DEAD_LETTERED │ (until manual requeue)
//!                    └───────────────┘
//! ```
//!
//! Payloads are a tagged union over job kinds so a new kind is added by
//! extending [`JobPayload`] and handling it in every exhaustive match.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{JobId, MissionId, PlaceId, UserId, VisitpayError};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting in the queue; due once `next_attempt_at_ms <= now`.
    Ready,
    /// Popped by a worker; a provider call may be in progress.
    InFlight,
    /// Failed and re-enqueued with a later `next_attempt_at_ms`.
    Retrying,
    /// Settled; the job has left the queue for good.
    Succeeded,
    /// Retry budget exhausted; parked until an operator requeues it.
    DeadLettered,
}

impl JobState {
    /// Can a job move from this state to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Ready, Self::InFlight)
                | (Self::InFlight, Self::Succeeded | Self::Retrying | Self::DeadLettered)
                | (Self::Retrying | Self::DeadLettered, Self::Ready)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::InFlight => write!(f, "IN_FLIGHT"),
            Self::Retrying => write!(f, "RETRYING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::DeadLettered => write!(f, "DEAD_LETTERED"),
        }
    }
}

/// Discriminant used to pop jobs of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Settlement,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settlement => write!(f, "settlement"),
        }
    }
}

/// Reward payout for one completed mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPayload {
    /// Who receives the reward.
    pub user_id: UserId,
    pub mission_id: MissionId,
    pub amount: Decimal,
    /// ISO-4217 code, e.g. `"KRW"`.
    pub currency: String,
    /// Stable key shared with the provider; also names the lease.
    pub idempotency_key: String,
}

impl SettlementPayload {
    /// Build a payload whose idempotency key is derived from the
    /// `(user, place, mission)` triple, so the same completion always maps to
    /// the same key.
    ///
    /// # Errors
    /// Returns `InvalidAmount` for zero or negative amounts and
    /// `InvalidInput` for an empty currency.
    pub fn new(
        user_id: UserId,
        place_id: &PlaceId,
        mission_id: MissionId,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> crate::Result<Self> {
        if amount <= Decimal::ZERO {
            return Err(VisitpayError::InvalidAmount {
                reason: format!("settlement amount must be positive, got {amount}"),
            });
        }
        let currency = currency.into();
        if currency.trim().is_empty() {
            return Err(VisitpayError::InvalidInput {
                reason: "currency must not be empty".to_string(),
            });
        }
        let idempotency_key = format!("{user_id}:{place_id}:{mission_id}");
        Ok(Self {
            user_id,
            mission_id,
            amount,
            currency,
            idempotency_key,
        })
    }
}

/// Strongly typed job payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Settlement(SettlementPayload),
}

impl JobPayload {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Settlement(_) => JobKind::Settlement,
        }
    }

    #[must_use]
    pub fn idempotency_key(&self) -> &str {
        match self {
            Self::Settlement(p) => &p.idempotency_key,
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementJob {
    pub id: JobId,
    pub payload: JobPayload,
    /// Failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time a worker may pop this job.
    pub next_attempt_at_ms: u64,
    /// Error captured from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl SettlementJob {
    #[must_use]
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            payload,
            attempts: 0,
            max_attempts,
            next_attempt_at_ms: 0,
            last_error: None,
        }
    }

    #[must_use]
    pub fn settlement(payload: SettlementPayload, max_attempts: u32) -> Self {
        Self::new(JobPayload::Settlement(payload), max_attempts)
    }

    #[must_use]
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at_ms <= now_ms
    }

    /// Whether another failure still leaves retry budget.
    #[must_use]
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: SettlementJob,
    /// The error string from the final attempt.
    pub error: String,
    pub dead_lettered_at_ms: u64,
}

/// Dummy payload for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl SettlementPayload {
    pub fn dummy(mission: &str) -> Self {
        Self {
            user_id: UserId::new("user-1"),
            mission_id: MissionId::new(mission),
            amount: Decimal::new(1000, 0),
            currency: "KRW".to_string(),
            idempotency_key: format!("user-1:gangnam:{mission}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobState::Ready.can_transition_to(JobState::InFlight));
        assert!(JobState::InFlight.can_transition_to(JobState::Succeeded));
        assert!(JobState::InFlight.can_transition_to(JobState::Retrying));
        assert!(JobState::InFlight.can_transition_to(JobState::DeadLettered));
        assert!(JobState::Retrying.can_transition_to(JobState::Ready));
        assert!(JobState::DeadLettered.can_transition_to(JobState::Ready));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobState::Succeeded.can_transition_to(JobState::Ready));
        assert!(!JobState::Ready.can_transition_to(JobState::Succeeded));
        assert!(!JobState::DeadLettered.can_transition_to(JobState::InFlight));
    }

    #[test]
    fn payload_derives_idempotency_key() {
        let p = SettlementPayload::new(
            UserId::new("u1"),
            &PlaceId::new("gangnam"),
            MissionId::new("m1"),
            Decimal::new(500, 0),
            "KRW",
        )
        .unwrap();
        assert_eq!(p.idempotency_key, "u1:gangnam:m1");
    }

    #[test]
    fn payload_rejects_non_positive_amount() {
        let err = SettlementPayload::new(
            UserId::new("u1"),
            &PlaceId::new("gangnam"),
            MissionId::new("m1"),
            Decimal::ZERO,
            "KRW",
        )
        .unwrap_err();
        assert!(matches!(err, VisitpayError::InvalidAmount { .. }));
    }

    #[test]
    fn payload_rejects_blank_currency() {
        let err = SettlementPayload::new(
            UserId::new("u1"),
            &PlaceId::new("gangnam"),
            MissionId::new("m1"),
            Decimal::ONE,
            "  ",
        )
        .unwrap_err();
        assert!(matches!(err, VisitpayError::InvalidInput { .. }));
    }

    #[test]
    fn job_due_and_budget() {
        let mut job = SettlementJob::settlement(SettlementPayload::dummy("m1"), 3);
        job.next_attempt_at_ms = 100;
        assert!(!job.is_due(99));
        assert!(job.is_due(100));
        assert!(job.has_attempts_left());
        job.attempts = 3;
        assert!(!job.has_attempts_left());
        assert_eq!(job.kind(), JobKind::Settlement);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = JobPayload::Settlement(SettlementPayload::dummy("m1"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "settlement");
        assert_eq!(json["amount"], "1000");
        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
