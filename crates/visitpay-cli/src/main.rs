//! `visitpay` CLI entry point.

mod cli;
mod commands;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use visitpay_types::{VisitpayConfig, constants};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    let json = cli.log_json || config.log_json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();

    debug!("visitpay v{}", constants::VERSION);

    match cli.command {
        Command::IssueToken { place, mission } => commands::issue::run(&config, &place, &mission),
        Command::VerifyToken { token } => commands::verify::run(&config, &token),
        Command::CheckConfig => commands::check_config::run(&config),
        Command::Demo(args) => commands::demo::run(config, args).await,
    }
}

/// File (or defaults), then environment secrets, then command-line secrets.
fn load_config(cli: &Cli) -> anyhow::Result<VisitpayConfig> {
    let mut config = match &cli.config {
        Some(path) => VisitpayConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => VisitpayConfig::default(),
    }
    .with_env_secrets();

    if let Some(secret) = &cli.secrets.proof_secret {
        config.signing.proof_secret.clone_from(secret);
    }
    if let Some(secret) = &cli.secrets.event_secret {
        config.signing.event_secret.clone_from(secret);
    }
    Ok(config)
}
