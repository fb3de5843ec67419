//! Error types for the VisitPay pipeline.
//!
//! All errors use the `VP_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Input errors
//! - 2xx: Proof token errors
//! - 3xx: Verification errors
//! - 4xx: Shared store errors
//! - 5xx: Settlement errors
//! - 6xx: Rate limiting errors
//! - 9xx: Configuration / internal errors
//!
//! Pure validators (token checks, geofence, consensus) do not return these
//! errors; they report structured negative outcomes instead.

use thiserror::Error;

use crate::JobId;

/// Central error enum for all VisitPay operations.
#[derive(Debug, Error)]
pub enum VisitpayError {
    // =================================================================
    // Input Errors (1xx)
    // =================================================================
    /// An identifier or field failed validation.
    #[error("VP_ERR_100: Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// A settlement amount was zero or negative.
    #[error("VP_ERR_101: Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    // =================================================================
    // Proof Token Errors (2xx)
    // =================================================================
    /// The configured signing secret cannot key an HMAC.
    #[error("VP_ERR_200: Signing key rejected: {reason}")]
    SigningKey { reason: String },

    // =================================================================
    // Shared Store Errors (4xx)
    // =================================================================
    /// The shared counter/lock store could not be reached.
    #[error("VP_ERR_400: Shared store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    // =================================================================
    // Settlement Errors (5xx)
    // =================================================================
    /// The settlement provider rejected or failed a capture.
    #[error("VP_ERR_500: Provider failure: {reason}")]
    ProviderFailure { reason: String },

    /// No dead-lettered job exists at the requested index.
    #[error("VP_ERR_501: Dead letter not found at index {index} (len {len})")]
    DeadLetterNotFound { index: usize, len: usize },

    /// The job is already enqueued.
    #[error("VP_ERR_502: Job already enqueued: {0}")]
    DuplicateJob(JobId),

    /// The settlement event sink refused the event.
    #[error("VP_ERR_503: Event emission failed: {reason}")]
    EventEmission { reason: String },

    /// A settlement with this idempotency key already completed here.
    #[error("VP_ERR_504: Already settled: {idempotency_key}")]
    AlreadySettled { idempotency_key: String },

    // =================================================================
    // Rate Limiting Errors (6xx)
    // =================================================================
    /// The caller exceeded the named limit.
    #[error("VP_ERR_600: Rate limit exceeded for {name}: retry after {retry_after_secs}s")]
    RateLimitExceeded { name: String, retry_after_secs: u64 },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Configuration error (missing secret, invalid bounds, bad file).
    #[error("VP_ERR_900: Configuration error: {0}")]
    Configuration(String),

    /// Serialization / deserialization error.
    #[error("VP_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// I/O error (disk, network).
    #[error("VP_ERR_902: I/O error: {0}")]
    Io(String),

    /// Unrecoverable internal error.
    #[error("VP_ERR_903: Internal error: {0}")]
    Internal(String),
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, VisitpayError>;

impl From<std::io::Error> for VisitpayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VisitpayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for VisitpayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}
