//! System-wide constants for the VisitPay pipeline.

/// Namespace prefixed to every proof-token signing payload.
pub const PROOF_TOKEN_NAMESPACE: &str = "visitpay:proof:v1";

/// Namespace prefixed to every settlement-event signing payload.
pub const SETTLEMENT_EVENT_NAMESPACE: &str = "visitpay:settlement:v1";

/// Field delimiter for canonical payloads and encoded tokens.
pub const PAYLOAD_DELIMITER: char = '|';

/// Number of fields in an encoded proof token.
pub const PROOF_TOKEN_FIELDS: usize = 5;

/// Default proof-token validity window (5 minutes).
pub const DEFAULT_TOKEN_TTL_MS: u64 = 5 * 60 * 1000;

/// Random bytes in a proof-token nonce.
pub const TOKEN_NONCE_BYTES: usize = 16;

/// Maximum scan reads retained per scan session.
pub const SCAN_BUFFER_CAPACITY: usize = 10;

/// Upper bound on concurrently open scan sessions per service.
pub const MAX_SCAN_SESSIONS: usize = 10_000;

/// Default number of consecutive matching reads required.
pub const DEFAULT_CONSENSUS_THRESHOLD: u32 = 3;

/// Default consensus time window in milliseconds.
pub const DEFAULT_CONSENSUS_WINDOW_MS: u64 = 1000;

/// Error rate above which the consensus threshold is raised by two.
pub const NOISE_HIGH_ERROR_RATE: f64 = 0.3;

/// Error rate above which the consensus threshold is raised by one.
pub const NOISE_ELEVATED_ERROR_RATE: f64 = 0.15;

/// Frame outcomes retained by the noise tracker.
pub const NOISE_HISTORY_CAPACITY: usize = 200;

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Default settlement attempts before dead-lettering.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Idempotency lease TTL for a settlement attempt.
pub const SETTLEMENT_LOCK_TTL_MS: u64 = 60_000;

/// Base delay for exponential settlement backoff.
pub const BACKOFF_BASE_MS: u64 = 1000;

/// Upper bound for settlement backoff.
pub const BACKOFF_CAP_MS: u64 = 60_000;

/// Default number of jobs popped per worker tick.
pub const DEFAULT_WORKER_BATCH_SIZE: usize = 10;

/// Default worker poll interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Key prefix for settlement idempotency leases.
pub const SETTLEMENT_LOCK_PREFIX: &str = "settle";

/// Key prefix for rate-limit counters.
pub const RATE_LIMIT_PREFIX: &str = "rl";

/// Event type emitted after a successful provider capture.
pub const PAYMENT_CAPTURED: &str = "payment.captured";

/// Environment variable holding the proof-token secret.
pub const ENV_PROOF_SECRET: &str = "VISITPAY_PROOF_SECRET";

/// Environment variable holding the settlement-event secret.
pub const ENV_EVENT_SECRET: &str = "VISITPAY_EVENT_SECRET";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
