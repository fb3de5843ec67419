//! Verification records and the eligibility they derive.
//!
//! A [`VerificationRecord`] is keyed uniquely by `(user, place)` and holds one
//! flag per verification factor. Flags only ever move `false → true`: a later
//! call that carries no positive evidence cannot erase an earlier success.
//! Eligibility is derived on read, never stored.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GeoPoint, PlaceId, UserId};

/// One verification factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationFlag {
    /// The user's location passed the place's geofence.
    Gps,
    /// A signed proof token was scanned with consensus.
    Qr,
    /// A proof-of-purchase receipt was accepted.
    Receipt,
}

impl fmt::Display for VerificationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gps => write!(f, "GPS"),
            Self::Qr => write!(f, "QR"),
            Self::Receipt => write!(f, "RECEIPT"),
        }
    }
}

/// Persisted verification state for one `(user, place)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub user_id: UserId,
    pub place_id: PlaceId,
    pub gps_ok: bool,
    pub qr_ok: bool,
    pub receipt_ok: bool,
    pub updated_at: DateTime<Utc>,
}

impl VerificationRecord {
    /// A fresh record with every flag unset, stamped `at`.
    #[must_use]
    pub fn new(user_id: UserId, place_id: PlaceId, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            place_id,
            gps_ok: false,
            qr_ok: false,
            receipt_ok: false,
            updated_at: at,
        }
    }

    /// Merge evidence for a single flag. A `false` never clears a `true`.
    pub fn merge(&mut self, flag: VerificationFlag, ok: bool, at: DateTime<Utc>) {
        let slot = match flag {
            VerificationFlag::Gps => &mut self.gps_ok,
            VerificationFlag::Qr => &mut self.qr_ok,
            VerificationFlag::Receipt => &mut self.receipt_ok,
        };
        *slot |= ok;
        self.updated_at = at;
    }

    /// Derive eligibility under the given policy.
    #[must_use]
    pub fn eligibility(&self, policy: EligibilityPolicy) -> Eligibility {
        let second_factor = if policy.receipt_required {
            self.qr_ok && self.receipt_ok
        } else {
            self.qr_ok || self.receipt_ok
        };
        Eligibility {
            allowed: self.gps_ok && second_factor,
            gps_ok: self.gps_ok,
            qr_ok: self.qr_ok,
            receipt_ok: self.receipt_ok,
        }
    }
}

/// Read model exposed to the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub allowed: bool,
    pub gps_ok: bool,
    pub qr_ok: bool,
    pub receipt_ok: bool,
}

/// How the second factor is satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityPolicy {
    /// When set, both QR and receipt are mandatory instead of either one.
    #[serde(default)]
    pub receipt_required: bool,
}

/// What an inbound submission carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundKind {
    /// A scanner read of a proof-token QR code.
    Scan { raw_text: String },
    /// A device location fix.
    Location { coords: GeoPoint, accuracy: f64 },
    /// A receipt whose proof was checked upstream.
    Receipt { receipt_id: String, accepted: bool },
}

/// A scan/location/receipt submission, already deserialized and shape-checked
/// by the routing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub user_id: UserId,
    pub place_id: PlaceId,
    #[serde(flatten)]
    pub kind: InboundKind,
    pub timestamp_ms: u64,
    pub source_tag: String,
}
