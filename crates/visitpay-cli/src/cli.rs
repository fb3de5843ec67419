//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use visitpay_types::constants::{ENV_EVENT_SECRET, ENV_PROOF_SECRET};

/// Operator tooling for the VisitPay verification-and-settlement pipeline.
#[derive(Parser, Debug)]
#[command(name = "visitpay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, short, global = true, env = "VISITPAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Tracing filter; `RUST_LOG` takes precedence.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(flatten)]
    pub secrets: SecretArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Signing secrets. Normally supplied through the environment.
#[derive(Args, Debug)]
pub struct SecretArgs {
    /// Proof-token HMAC secret.
    #[arg(long, global = true, env = ENV_PROOF_SECRET, hide_env_values = true)]
    pub proof_secret: Option<String>,

    /// Settlement-event HMAC secret.
    #[arg(long, global = true, env = ENV_EVENT_SECRET, hide_env_values = true)]
    pub event_secret: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Issue a signed proof token for display at a place.
    IssueToken {
        #[arg(long)]
        place: String,
        #[arg(long)]
        mission: String,
    },

    /// Check an encoded proof token.
    VerifyToken {
        /// The `place|mission|issuedAt|nonce|signature` string.
        token: String,
    },

    /// Load and validate configuration, then print it with secrets redacted.
    CheckConfig,

    /// Run one visit end to end against in-process components.
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    #[arg(long, default_value = "demo-user")]
    pub user: String,
    #[arg(long, default_value = "gangnam")]
    pub place: String,
    #[arg(long, default_value = "m1")]
    pub mission: String,
    #[arg(long, default_value_t = 37.4979)]
    pub lat: f64,
    #[arg(long, default_value_t = 127.0276)]
    pub lng: f64,
    #[arg(long, default_value_t = 150.0)]
    pub radius: f64,
    #[arg(long, default_value = "1000")]
    pub amount: Decimal,
    #[arg(long, default_value = "KRW")]
    pub currency: String,
    /// Make the provider fail this many times before succeeding.
    #[arg(long, default_value_t = 0)]
    pub provider_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn demo_defaults_target_gangnam() {
        let cli = Cli::try_parse_from(["visitpay", "demo"]).unwrap();
        let Command::Demo(args) = cli.command else {
            panic!("expected demo");
        };
        assert_eq!(args.place, "gangnam");
        assert_eq!(args.amount, Decimal::new(1000, 0));
        assert_eq!(args.provider_failures, 0);
    }

    #[test]
    fn issue_token_requires_place_and_mission() {
        assert!(Cli::try_parse_from(["visitpay", "issue-token", "--place", "p"]).is_err());
        let cli =
            Cli::try_parse_from(["visitpay", "issue-token", "--place", "p", "--mission", "m"])
                .unwrap();
        assert!(matches!(cli.command, Command::IssueToken { .. }));
    }
}
