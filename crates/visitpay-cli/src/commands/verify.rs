use visitpay_types::{ProofToken, VisitpayConfig};

use super::proof_signer;

/// Prints the check result; exits non-zero unless the token is valid.
pub fn run(config: &VisitpayConfig, raw: &str) -> anyhow::Result<()> {
    let signer = proof_signer(config)?;
    let check = signer.check_encoded(raw.trim());
    match ProofToken::decode(raw.trim()) {
        Some(token) => println!(
            "{check}  place={} mission={} issued_at_ms={} expires_at_ms={}",
            token.place_id,
            token.mission_id,
            token.issued_at_ms,
            token.expires_at_ms(signer.ttl_ms())
        ),
        None => println!("{check}"),
    }
    anyhow::ensure!(check.is_valid(), "token rejected: {check}");
    Ok(())
}
