use visitpay_types::{MissionId, PlaceId, VisitpayConfig};

use super::proof_signer;

pub fn run(config: &VisitpayConfig, place: &str, mission: &str) -> anyhow::Result<()> {
    let signer = proof_signer(config)?;
    let token = signer.issue(PlaceId::new(place), MissionId::new(mission))?;
    tracing::info!(place, mission, issued_at_ms = token.issued_at_ms, "proof token issued");
    println!("{}", token.encode());
    Ok(())
}
