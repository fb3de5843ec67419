//! Multi-frame scan consensus.
//!
//! A scanner reports the same code many times per second, and a single frame
//! can be misread. A read is accepted only once the same text has been seen
//! on enough consecutive frames inside a short time window:
//!
//! ```text
//!   buffer (oldest → newest, capacity 10)
//!   ┌───┬───┬───┬───┬───┐
//!   │ A │ B │ A │ A │ A │  ← newest
//!   └───┴───┴───┴───┴───┘
//!             └─────────┘ streak = 3 → valid at threshold 3
//! ```
//!
//! Only reads within `window_ms` of the newest read are considered. A
//! different text anywhere in the walk back ends the streak.
//!
//! The threshold may be raised adaptively from the observed noise level; see
//! [`adaptive_threshold`] and [`NoiseTracker`].

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;
use visitpay_types::constants::{
    NOISE_ELEVATED_ERROR_RATE, NOISE_HIGH_ERROR_RATE, NOISE_HISTORY_CAPACITY, SCAN_BUFFER_CAPACITY,
};
use visitpay_types::{ConsensusConfig, ConsensusResult, ScanRead};

/// Sliding buffer of recent reads for one scan session.
#[derive(Debug, Clone)]
pub struct ScanSession {
    buffer: VecDeque<ScanRead>,
    capacity: usize,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::with_capacity(SCAN_BUFFER_CAPACITY)
    }
}

impl ScanSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A session keeping at most `capacity` reads (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `read` and compute the consensus verdict for it.
    ///
    /// A `threshold` of zero is treated as one.
    pub fn validate(&mut self, read: ScanRead, threshold: u32, window_ms: u64) -> ConsensusResult {
        let threshold = threshold.max(1);
        let newest_ts = read.timestamp_ms;
        let newest_text = read.text.clone();

        self.buffer.push_back(read);
        while self.buffer.len() > self.capacity {
            self.buffer.pop_front();
        }

        let consecutive_matches = self
            .buffer
            .iter()
            .rev()
            .filter(|r| r.timestamp_ms.abs_diff(newest_ts) <= window_ms)
            .take_while(|r| r.text == newest_text)
            .count();
        let consecutive_matches = u32::try_from(consecutive_matches).unwrap_or(u32::MAX);

        let confidence = (u64::from(consecutive_matches) * 100 / u64::from(threshold)).min(100);

        ConsensusResult {
            valid: consecutive_matches >= threshold,
            confidence_percent: u8::try_from(confidence).unwrap_or(100),
            consecutive_matches,
            threshold_used: threshold,
        }
    }

    /// Whether `read` disagrees with the newest buffered read, if that read
    /// falls inside the window.
    fn disagrees_with_last(&self, read: &ScanRead, window_ms: u64) -> Option<bool> {
        self.buffer
            .back()
            .filter(|last| last.timestamp_ms.abs_diff(read.timestamp_ms) <= window_ms)
            .map(|last| last.text != read.text)
    }

    /// Drop all buffered reads.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Raise the base threshold when the scanner is noisy.
///
/// | error rate      | threshold  |
/// |-----------------|------------|
/// | `> 0.30`        | `base + 2` |
/// | `> 0.15`        | `base + 1` |
/// | otherwise       | `base`     |
#[must_use]
pub fn adaptive_threshold(base: u32, error_rate: f64) -> u32 {
    if error_rate > NOISE_HIGH_ERROR_RATE {
        base.saturating_add(2)
    } else if error_rate > NOISE_ELEVATED_ERROR_RATE {
        base.saturating_add(1)
    } else {
        base
    }
}

/// Rolling record of whether consecutive in-window reads disagreed.
#[derive(Debug, Clone)]
pub struct NoiseTracker {
    history: VecDeque<bool>,
    capacity: usize,
}

impl Default for NoiseTracker {
    fn default() -> Self {
        Self::with_capacity(NOISE_HISTORY_CAPACITY)
    }
}

impl NoiseTracker {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one comparison: `true` if the read disagreed with its
    /// predecessor.
    pub fn record(&mut self, mismatch: bool) {
        self.history.push_back(mismatch);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    /// Fraction of recorded comparisons that disagreed. Zero when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let errors = self.history.iter().filter(|m| **m).count();
        errors as f64 / self.history.len() as f64
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.history.len()
    }
}

/// Applies the configured consensus policy across many sessions and feeds a
/// shared noise tracker.
#[derive(Debug)]
pub struct ConsensusValidator {
    config: ConsensusConfig,
    noise: Mutex<NoiseTracker>,
}

impl ConsensusValidator {
    #[must_use]
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            noise: Mutex::new(NoiseTracker::default()),
        }
    }

    /// Threshold currently in force.
    #[must_use]
    pub fn threshold(&self) -> u32 {
        if self.config.adaptive {
            adaptive_threshold(self.config.threshold, self.noise.lock().error_rate())
        } else {
            self.config.threshold
        }
    }

    #[must_use]
    pub fn error_rate(&self) -> f64 {
        self.noise.lock().error_rate()
    }

    /// Reads older than this no longer count toward consensus.
    #[must_use]
    pub fn window_ms(&self) -> u64 {
        self.config.window_ms
    }

    /// A session sized per configuration.
    #[must_use]
    pub fn new_session(&self) -> ScanSession {
        ScanSession::with_capacity(self.config.buffer_capacity)
    }

    /// Validate `read` in `session`. A valid verdict clears the session so
    /// the next code starts from an empty buffer.
    pub fn observe(&self, session: &mut ScanSession, read: ScanRead) -> ConsensusResult {
        let threshold = self.threshold();
        if let Some(mismatch) = session.disagrees_with_last(&read, self.config.window_ms) {
            self.noise.lock().record(mismatch);
        }
        let result = session.validate(read, threshold, self.config.window_ms);

        if result.valid {
            debug!(
                matches = result.consecutive_matches,
                threshold, "scan consensus reached"
            );
            session.clear();
        }
        result
    }
}
