//! Subcommand implementations.

pub mod check_config;
pub mod demo;
pub mod issue;
pub mod verify;

use std::sync::Arc;

use anyhow::Context;
use visitpay_ingress::Signer;
use visitpay_types::{Clock, SystemClock, VisitpayConfig};

/// Proof-token signer over the system clock.
pub(crate) fn proof_signer(config: &VisitpayConfig) -> anyhow::Result<Signer> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Signer::from_config(&config.signing, clock).context("proof signer unavailable")
}
