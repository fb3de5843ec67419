use anyhow::Context;
use visitpay_types::VisitpayConfig;

pub fn run(config: &VisitpayConfig) -> anyhow::Result<()> {
    config.validate().context("configuration rejected")?;
    println!("{config:#?}");
    println!("configuration OK");
    Ok(())
}
