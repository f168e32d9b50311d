//! Level metering for voice activity detection
//!
//! RMS energy, decibel conversion with a silence floor, and the exponential
//! smoother that keeps transient spikes from flipping the VAD.

use serde::Serialize;

/// Amplitude floor applied before taking the logarithm
pub const RMS_EPSILON: f32 = 1e-5;

/// Level reported for digital silence (`20·log10(RMS_EPSILON)`)
pub const SILENCE_FLOOR_DB: f32 = -100.0;

/// A smoothed level reading for one processed block
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelSample {
    /// Smoothed level in dBFS
    pub db: f32,
    /// Unsmoothed RMS of the block, 0.0-1.0
    pub rms: f32,
    /// Audio-clock time of the block start, in milliseconds
    pub timestamp_ms: u64,
}

/// Calculate RMS level for a buffer of samples
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Convert an RMS amplitude to decibels, never returning `-inf`
pub fn rms_to_db(rms: f32) -> f32 {
    20.0 * rms.max(RMS_EPSILON).log10()
}

/// Exponential level smoother
///
/// `smoothed = α·previous + (1-α)·sample`. With α = 0 the output follows the
/// input exactly.
#[derive(Debug, Clone)]
pub struct LevelSmoother {
    alpha: f32,
    smoothed_db: f32,
}

impl LevelSmoother {
    /// Create a smoother starting at the silence floor
    ///
    /// `alpha` is clamped to `0.0..=0.999`.
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 0.999),
            smoothed_db: SILENCE_FLOOR_DB,
        }
    }

    /// Fold one reading into the smoothed level and return it
    pub fn update(&mut self, sample_db: f32) -> f32 {
        self.smoothed_db = self.alpha * self.smoothed_db + (1.0 - self.alpha) * sample_db;
        self.smoothed_db
    }

    /// Current smoothed level
    pub fn value(&self) -> f32 {
        self.smoothed_db
    }

    /// Return to the silence floor
    pub fn reset(&mut self) {
        self.smoothed_db = SILENCE_FLOOR_DB;
    }
}
