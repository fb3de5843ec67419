//! Scanner observations and the consensus verdict derived from them.

use serde::{Deserialize, Serialize};

/// One raw observation from a scanning sensor.
///
/// Ephemeral: held only in a scan session's sliding buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRead {
    /// Decoded text (for QR codes, the encoded proof token).
    pub text: String,
    /// Sensor callback time, milliseconds since UNIX epoch.
    pub timestamp_ms: u64,
    /// Which sensor or camera produced the read.
    pub source_tag: String,
}

impl ScanRead {
    #[must_use]
    pub fn new(text: impl Into<String>, timestamp_ms: u64, source_tag: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp_ms,
            source_tag: source_tag.into(),
        }
    }
}

/// Consensus verdict for the newest read. Recomputed on every read, never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// `consecutive_matches >= threshold_used`.
    pub valid: bool,
    /// `min(100, consecutive_matches / threshold_used * 100)`.
    pub confidence_percent: u8,
    /// Length of the matching streak ending at the newest read.
    pub consecutive_matches: u32,
    /// The threshold that was applied (after any adaptive adjustment).
    pub threshold_used: u32,
}
