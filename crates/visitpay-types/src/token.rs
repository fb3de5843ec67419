//! # ProofToken: signed, time-bound capability for one (place, mission)
//!
//! A proof token is printed as a QR code at a place. Scanning it proves the
//! user was physically present for a mission.
//!
//! ## Wire format
//!
//! ```text
//! placeId|missionId|issuedAtMs|nonce|signature
//! ```
//!
//! The signature is HMAC-SHA256 over the canonical payload
//! `namespace|placeId|missionId|issuedAtMs|nonce`, URL-safe base64 without
//! padding. Tokens are immutable once issued.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{PAYLOAD_DELIMITER, PROOF_TOKEN_FIELDS};
use crate::{MissionId, PlaceId};

/// A signed proof token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofToken {
    /// The place the token was printed for.
    pub place_id: PlaceId,
    /// The mission this token completes.
    pub mission_id: MissionId,
    /// Issuance time, milliseconds since UNIX epoch.
    pub issued_at_ms: u64,
    /// Random hex nonce; makes every token unique.
    pub nonce: String,
    /// URL-safe base64 HMAC over [`ProofToken::signing_payload`].
    pub signature: String,
}

impl ProofToken {
    /// Canonical signing payload.
    ///
    /// Format: `namespace|placeId|missionId|issuedAtMs|nonce`
    #[must_use]
    pub fn signing_payload(&self, namespace: &str) -> String {
        canonical_payload(&[
            namespace,
            self.place_id.as_str(),
            self.mission_id.as_str(),
            &self.issued_at_ms.to_string(),
            &self.nonce,
        ])
    }

    /// Encode into the five-field wire format carried by the QR code.
    #[must_use]
    pub fn encode(&self) -> String {
        canonical_payload(&[
            self.place_id.as_str(),
            self.mission_id.as_str(),
            &self.issued_at_ms.to_string(),
            &self.nonce,
            &self.signature,
        ])
    }

    /// Parse the wire format. Returns `None` for anything that is not exactly
    /// five non-empty fields with a numeric timestamp.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        let fields: Vec<&str> = raw.trim().split(PAYLOAD_DELIMITER).collect();
        if fields.len() != PROOF_TOKEN_FIELDS || fields.iter().any(|f| f.is_empty()) {
            return None;
        }
        let issued_at_ms = fields[2].parse::<u64>().ok()?;
        Some(Self {
            place_id: PlaceId::new(fields[0]),
            mission_id: MissionId::new(fields[1]),
            issued_at_ms,
            nonce: fields[3].to_string(),
            signature: fields[4].to_string(),
        })
    }

    /// The instant after which this token is no longer accepted.
    #[must_use]
    pub fn expires_at_ms(&self, ttl_ms: u64) -> u64 {
        self.issued_at_ms.saturating_add(ttl_ms)
    }
}

/// Join fields with the payload delimiter.
#[must_use]
pub fn canonical_payload(fields: &[&str]) -> String {
    let mut out = String::with_capacity(fields.iter().map(|f| f.len() + 1).sum());
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(PAYLOAD_DELIMITER);
        }
        out.push_str(field);
    }
    out
}

/// Outcome of checking a proof token. Never an error: malformed input is a
/// negative outcome like any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenCheck {
    /// Signature matches and the token is inside its validity window.
    Valid,
    /// Wrong field count, empty fields, or a non-numeric timestamp.
    Malformed,
    /// The signature does not match the payload.
    BadSignature,
    /// The validity window has elapsed.
    Expired,
    /// Issued in the future relative to the verifier's clock.
    NotYetValid,
}

impl TokenCheck {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

impl fmt::Display for TokenCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "VALID"),
            Self::Malformed => write!(f, "MALFORMED"),
            Self::BadSignature => write!(f, "BAD_SIGNATURE"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::NotYetValid => write!(f, "NOT_YET_VALID"),
        }
    }
}

/// Dummy token for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl ProofToken {
    pub fn dummy(place: &str, mission: &str, issued_at_ms: u64) -> Self {
        Self {
            place_id: PlaceId::new(place),
            mission_id: MissionId::new(mission),
            issued_at_ms,
            nonce: "00112233445566778899aabbccddeeff".to_string(),
            signature: "AAAA".to_string(),
        }
    }
}
