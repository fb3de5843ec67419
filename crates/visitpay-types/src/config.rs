//! Configuration for a VisitPay node.
//!
//! Loaded from TOML; every field has a default so a file only needs to name
//! what it changes. Signing secrets are the exception: they have no default
//! and [`VisitpayConfig::validate`] refuses to start without them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{EligibilityPolicy, Result, VisitpayError, constants};

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitpayConfig {
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub eligibility: EligibilityPolicy,
    /// Default tracing filter; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for VisitpayConfig {
    fn default() -> Self {
        Self {
            signing: SigningConfig::default(),
            consensus: ConsensusConfig::default(),
            settlement: SettlementConfig::default(),
            rate_limit: RateLimitConfig::default(),
            eligibility: EligibilityPolicy::default(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl VisitpayConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Fill signing secrets from `VISITPAY_PROOF_SECRET` /
    /// `VISITPAY_EVENT_SECRET` when set.
    #[must_use]
    pub fn with_env_secrets(mut self) -> Self {
        if let Ok(secret) = std::env::var(constants::ENV_PROOF_SECRET) {
            self.signing.proof_secret = secret;
        }
        if let Ok(secret) = std::env::var(constants::ENV_EVENT_SECRET) {
            self.signing.event_secret = secret;
        }
        self
    }

    /// Reject configurations the pipeline cannot run safely with. A missing
    /// signing secret is fatal at startup, never tolerated per request.
    pub fn validate(&self) -> Result<()> {
        if self.signing.proof_secret.is_empty() {
            return Err(VisitpayError::Configuration(format!(
                "proof signing secret is missing (set signing.proof_secret or {})",
                constants::ENV_PROOF_SECRET
            )));
        }
        if self.signing.event_secret.is_empty() {
            return Err(VisitpayError::Configuration(format!(
                "event signing secret is missing (set signing.event_secret or {})",
                constants::ENV_EVENT_SECRET
            )));
        }
        if self.signing.proof_secret == self.signing.event_secret {
            return Err(VisitpayError::Configuration(
                "proof and event secrets must differ".to_string(),
            ));
        }
        if self.signing.token_ttl_ms == 0 {
            return Err(VisitpayError::Configuration(
                "signing.token_ttl_ms must be > 0".to_string(),
            ));
        }
        if self.consensus.threshold == 0 {
            return Err(VisitpayError::Configuration(
                "consensus.threshold must be > 0".to_string(),
            ));
        }
        if self.consensus.buffer_capacity == 0 {
            return Err(VisitpayError::Configuration(
                "consensus.buffer_capacity must be > 0".to_string(),
            ));
        }
        if self.settlement.max_attempts == 0 {
            return Err(VisitpayError::Configuration(
                "settlement.max_attempts must be > 0".to_string(),
            ));
        }
        if self.settlement.backoff_base_ms > self.settlement.backoff_cap_ms {
            return Err(VisitpayError::Configuration(format!(
                "settlement.backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.settlement.backoff_base_ms, self.settlement.backoff_cap_ms
            )));
        }
        if self.settlement.batch_size == 0 {
            return Err(VisitpayError::Configuration(
                "settlement.batch_size must be > 0".to_string(),
            ));
        }
        for (name, rule) in &self.rate_limit.rules {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(VisitpayError::Configuration(format!(
                    "rate_limit.rules.{name} needs a non-zero limit and window"
                )));
            }
        }
        Ok(())
    }
}

/// HMAC secrets and namespaces.
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Secret for proof tokens. No default.
    #[serde(default)]
    pub proof_secret: String,
    /// Secret for settlement events. Must differ from `proof_secret`.
    #[serde(default)]
    pub event_secret: String,
    #[serde(default = "default_proof_namespace")]
    pub proof_namespace: String,
    #[serde(default = "default_event_namespace")]
    pub event_namespace: String,
    /// Proof-token validity window.
    #[serde(default = "default_token_ttl_ms")]
    pub token_ttl_ms: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            proof_secret: String::new(),
            event_secret: String::new(),
            proof_namespace: default_proof_namespace(),
            event_namespace: default_event_namespace(),
            token_ttl_ms: default_token_ttl_ms(),
        }
    }
}

// Secrets never reach logs.
impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("proof_secret", &redact(&self.proof_secret))
            .field("event_secret", &redact(&self.event_secret))
            .field("proof_namespace", &self.proof_namespace)
            .field("event_namespace", &self.event_namespace)
            .field("token_ttl_ms", &self.token_ttl_ms)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}

/// Scan consensus tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Base number of consecutive matching reads.
    #[serde(default = "default_consensus_threshold")]
    pub threshold: u32,
    #[serde(default = "default_consensus_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Raise the threshold when recent scans are noisy.
    #[serde(default = "default_true")]
    pub adaptive: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: default_consensus_threshold(),
            window_ms: default_consensus_window_ms(),
            buffer_capacity: default_buffer_capacity(),
            adaptive: true,
        }
    }
}

/// Order in which due jobs leave the ready set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainOrder {
    /// Oldest enqueued first.
    #[default]
    Fifo,
    /// Most recently enqueued first.
    Lifo,
}

/// Settlement queue and worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Jobs popped per worker tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub drain_order: DrainOrder,
    /// Provider name stamped on emitted events.
    #[serde(default = "default_provider")]
    pub provider: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lock_ttl_ms: default_lock_ttl_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_order: DrainOrder::default(),
            provider: default_provider(),
        }
    }
}

/// One named request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window_secs: u64,
}

/// Named request budgets, keyed by operation name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_rules")]
    pub rules: BTreeMap<String, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rules: default_rate_limit_rules(),
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<RateLimitRule> {
        self.rules.get(name).copied()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_proof_namespace() -> String {
    constants::PROOF_TOKEN_NAMESPACE.to_string()
}

fn default_event_namespace() -> String {
    constants::SETTLEMENT_EVENT_NAMESPACE.to_string()
}

fn default_token_ttl_ms() -> u64 {
    constants::DEFAULT_TOKEN_TTL_MS
}

fn default_consensus_threshold() -> u32 {
    constants::DEFAULT_CONSENSUS_THRESHOLD
}

fn default_consensus_window_ms() -> u64 {
    constants::DEFAULT_CONSENSUS_WINDOW_MS
}

fn default_buffer_capacity() -> usize {
    constants::SCAN_BUFFER_CAPACITY
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    constants::DEFAULT_MAX_ATTEMPTS
}

fn default_lock_ttl_ms() -> u64 {
    constants::SETTLEMENT_LOCK_TTL_MS
}

fn default_backoff_base_ms() -> u64 {
    constants::BACKOFF_BASE_MS
}

fn default_backoff_cap_ms() -> u64 {
    constants::BACKOFF_CAP_MS
}

fn default_batch_size() -> usize {
    constants::DEFAULT_WORKER_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    constants::DEFAULT_POLL_INTERVAL_MS
}

fn default_provider() -> String {
    "simulated".to_string()
}

fn default_rate_limit_rules() -> BTreeMap<String, RateLimitRule> {
    [
        ("scan", 600, 60),
        ("location", 60, 60),
        ("receipt", 10, 60),
        ("issue_token", 120, 60),
    ]
    .into_iter()
    .map(|(name, limit, window_secs)| (name.to_string(), RateLimitRule { limit, window_secs }))
    .collect()
}
