//! HMAC-SHA256 signing for proof tokens and settlement events.
//!
//! Both token kinds use the same scheme: HMAC-SHA256 over a pipe-delimited
//! canonical payload whose first field is a namespace. They differ only in
//! secret, namespace, and encoding (URL-safe base64 for tokens, hex for
//! webhook-style events).
//!
//! Verification recomputes the expected tag and compares it in constant
//! time. Malformed input of any kind yields a negative result, never a panic.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use visitpay_types::constants::TOKEN_NONCE_BYTES;
use visitpay_types::{
    Clock, MissionId, PlaceId, ProofToken, Result, SettlementEvent, SigningConfig, TokenCheck,
    VisitpayError,
};

type HmacSha256 = Hmac<Sha256>;

/// Raw HMAC-SHA256 tag. HMAC accepts keys of any length, so key setup only
/// fails for an empty secret, which constructors already reject.
fn hmac_tag(payload: &str, secret: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload.as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

/// Constant-time tag comparison. Length mismatch is a plain `false`.
fn tags_match(expected: &[u8], provided: &[u8]) -> bool {
    bool::from(expected.ct_eq(provided))
}

fn require_secret(secret: &[u8], what: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(VisitpayError::SigningKey {
            reason: format!("{what} signing secret is empty"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Proof tokens
// ---------------------------------------------------------------------------

/// Issues and verifies proof tokens.
///
/// Holds no token state: issuance is a pure function of its inputs plus the
/// clock and a fresh random nonce.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
    namespace: String,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl Signer {
    /// # Errors
    /// Returns `SigningKey` for an empty secret.
    pub fn new(
        secret: impl AsRef<[u8]>,
        namespace: impl Into<String>,
        ttl_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let secret = secret.as_ref().to_vec();
        require_secret(&secret, "proof")?;
        Ok(Self {
            secret,
            namespace: namespace.into(),
            ttl_ms,
            clock,
        })
    }

    pub fn from_config(config: &SigningConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(
            &config.proof_secret,
            config.proof_namespace.clone(),
            config.token_ttl_ms,
            clock,
        )
    }

    /// HMAC-SHA256 of `payload`, URL-safe base64 without padding.
    #[must_use]
    pub fn sign(payload: &str, secret: &[u8]) -> String {
        hmac_tag(payload, secret)
            .map(|tag| URL_SAFE_NO_PAD.encode(tag))
            .unwrap_or_default()
    }

    /// HMAC-SHA256 of `payload`, lowercase hex.
    #[must_use]
    pub fn sign_hex(payload: &str, secret: &[u8]) -> String {
        hmac_tag(payload, secret).map(hex::encode).unwrap_or_default()
    }

    /// Issue a token for one `(place, mission)` pair.
    ///
    /// # Errors
    /// Returns `InvalidInput` if either id is empty or contains the payload
    /// delimiter.
    pub fn issue(&self, place_id: PlaceId, mission_id: MissionId) -> Result<ProofToken> {
        if !place_id.is_payload_safe() || !mission_id.is_payload_safe() {
            return Err(VisitpayError::InvalidInput {
                reason: format!("ids must be non-empty and free of '|': {place_id} / {mission_id}"),
            });
        }
        let mut token = ProofToken {
            place_id,
            mission_id,
            issued_at_ms: self.clock.now_ms(),
            nonce: hex::encode(rand::random::<[u8; TOKEN_NONCE_BYTES]>()),
            signature: String::new(),
        };
        token.signature = Self::sign(&token.signing_payload(&self.namespace), &self.secret);
        Ok(token)
    }

    /// Whether the signature matches, ignoring the validity window.
    #[must_use]
    pub fn verify_signature(&self, token: &ProofToken) -> bool {
        let Ok(provided) = URL_SAFE_NO_PAD.decode(token.signature.as_bytes()) else {
            return false;
        };
        hmac_tag(&token.signing_payload(&self.namespace), &self.secret)
            .is_some_and(|expected| tags_match(&expected, &provided))
    }

    /// Full check: shape, signature, then validity window.
    #[must_use]
    pub fn check(&self, token: &ProofToken) -> TokenCheck {
        if !token.place_id.is_payload_safe()
            || !token.mission_id.is_payload_safe()
            || token.nonce.is_empty()
        {
            return TokenCheck::Malformed;
        }
        if !self.verify_signature(token) {
            return TokenCheck::BadSignature;
        }
        let now = self.clock.now_ms();
        if token.issued_at_ms > now {
            return TokenCheck::NotYetValid;
        }
        if now > token.expires_at_ms(self.ttl_ms) {
            return TokenCheck::Expired;
        }
        TokenCheck::Valid
    }

    /// Signature valid and token inside its validity window.
    #[must_use]
    pub fn verify(&self, token: &ProofToken) -> bool {
        self.check(token).is_valid()
    }

    /// Decode the wire format, then [`check`](Self::check).
    #[must_use]
    pub fn check_encoded(&self, raw: &str) -> TokenCheck {
        match ProofToken::decode(raw) {
            Some(token) => self.check(&token),
            None => {
                debug!("proof token failed to decode");
                TokenCheck::Malformed
            }
        }
    }

    #[must_use]
    pub fn verify_encoded(&self, raw: &str) -> bool {
        self.check_encoded(raw).is_valid()
    }

    #[must_use]
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }
}

// ---------------------------------------------------------------------------
// Settlement events
// ---------------------------------------------------------------------------

/// Signs `payment.captured` events with the event secret.
#[derive(Clone)]
pub struct EventSigner {
    secret: Vec<u8>,
    namespace: String,
}

impl EventSigner {
    /// # Errors
    /// Returns `SigningKey` for an empty secret.
    pub fn new(secret: impl AsRef<[u8]>, namespace: impl Into<String>) -> Result<Self> {
        let secret = secret.as_ref().to_vec();
        require_secret(&secret, "event")?;
        Ok(Self {
            secret,
            namespace: namespace.into(),
        })
    }

    pub fn from_config(config: &SigningConfig) -> Result<Self> {
        Self::new(&config.event_secret, config.event_namespace.clone())
    }

    /// Fill in `event.signature`.
    pub fn sign(&self, event: &mut SettlementEvent) {
        event.signature = Signer::sign_hex(&event.signing_payload(&self.namespace), &self.secret);
    }

    #[must_use]
    pub fn verify(&self, event: &SettlementEvent) -> bool {
        let Ok(provided) = hex::decode(&event.signature) else {
            return false;
        };
        hmac_tag(&event.signing_payload(&self.namespace), &self.secret)
            .is_some_and(|expected| tags_match(&expected, &provided))
    }
}
