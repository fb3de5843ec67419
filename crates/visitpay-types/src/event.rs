//! Signed settlement events: the webhook-equivalent emitted after a
//! successful provider capture.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::MissionId;
use crate::token::canonical_payload;

/// A `payment.captured` event.
///
/// Signed with the same HMAC scheme as proof tokens but a distinct secret and
/// namespace; the signature is lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    /// Provider that captured the payment.
    pub provider: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub mission_id: MissionId,
    /// The provider's payment reference.
    pub external_payment_id: String,
    pub amount: Decimal,
    pub currency: String,
    /// Capture time, milliseconds since UNIX epoch.
    pub ts: u64,
    pub signature: String,
}

impl SettlementEvent {
    /// Canonical signing payload.
    ///
    /// Format: `namespace|provider|type|missionId|externalPaymentId|amount|currency|ts`
    #[must_use]
    pub fn signing_payload(&self, namespace: &str) -> String {
        canonical_payload(&[
            namespace,
            &self.provider,
            &self.event_type,
            self.mission_id.as_str(),
            &self.external_payment_id,
            &self.amount.to_string(),
            &self.currency,
            &self.ts.to_string(),
        ])
    }
}
