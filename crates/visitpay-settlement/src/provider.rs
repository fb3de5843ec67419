//! Settlement provider seam.
//!
//! The provider is the external payment system that actually moves money.
//! It receives the job's idempotency key and must treat repeated captures
//! with the same key as one capture: that is the final guard against
//! duplicates when a lease expires mid-call.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;
use visitpay_types::{Result, SettlementPayload, VisitpayError};

/// A completed capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Provider-side payment reference.
    pub external_payment_id: String,
}

#[async_trait]
pub trait SettlementProvider: Send + Sync {
    /// Name stamped on emitted events.
    fn name(&self) -> &str;

    /// Capture `payload.amount` for `payload.user_id`, idempotently on
    /// `payload.idempotency_key`.
    async fn capture(&self, payload: &SettlementPayload) -> Result<Capture>;
}

/// What the next scripted call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Succeed,
    Fail(String),
}

#[derive(Debug, Default)]
struct SimulatedState {
    script: VecDeque<ScriptedOutcome>,
    fail_all: Option<String>,
    captured: HashMap<String, Capture>,
    calls: usize,
}

/// In-process provider that honors idempotency keys and can be scripted to
/// fail.
///
/// Scripted outcomes are consumed in order; once the script runs out every
/// call succeeds, unless [`SimulatedProvider::failing`] was used.
#[derive(Debug)]
pub struct SimulatedProvider {
    name: String,
    state: Mutex<SimulatedState>,
}

impl SimulatedProvider {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// A provider whose every call fails with `reason`.
    #[must_use]
    pub fn failing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        let provider = Self::new(name);
        provider.state.lock().fail_all = Some(reason.into());
        provider
    }

    /// Append outcomes for upcoming calls.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Stop failing every call.
    pub fn recover(&self) {
        self.state.lock().fail_all = None;
    }

    /// Calls made so far, successful or not.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Distinct idempotency keys captured.
    #[must_use]
    pub fn captured(&self) -> usize {
        self.state.lock().captured.len()
    }
}

#[async_trait]
impl SettlementProvider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capture(&self, payload: &SettlementPayload) -> Result<Capture> {
        let mut state = self.state.lock();
        state.calls += 1;

        let outcome = state.script.pop_front().unwrap_or(ScriptedOutcome::Succeed);
        if let Some(reason) = state.fail_all.clone() {
            return Err(VisitpayError::ProviderFailure { reason });
        }
        if let ScriptedOutcome::Fail(reason) = outcome {
            return Err(VisitpayError::ProviderFailure { reason });
        }

        let capture = state
            .captured
            .entry(payload.idempotency_key.clone())
            .or_insert_with(|| Capture {
                external_payment_id: format!("pay_{}", Uuid::now_v7().simple()),
            })
            .clone();
        debug!(
            key = %payload.idempotency_key,
            payment = %capture.external_payment_id,
            "simulated capture"
        );
        Ok(capture)
    }
}
