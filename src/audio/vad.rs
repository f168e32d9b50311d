//! Voice Activity Detection (VAD) for speech boundary detection
//!
//! Level-based detection: each fixed-length block is reduced to an RMS level
//! in dBFS, smoothed, and compared against a threshold. Crossing the threshold
//! starts an utterance immediately; the utterance ends only after the level
//! has stayed below the threshold for the full silence timeout, measured on
//! the audio clock (blocks processed × block duration).

use super::metering::{calculate_rms, rms_to_db, LevelSample, LevelSmoother};
use super::pre_roll::{pre_roll_capacity, AudioBlock, PreRollBuffer};
use serde::{Deserialize, Serialize};

/// Configuration for Voice Activity Detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Smoothed level at or above which a block counts as voice (dBFS)
    ///
    /// Default: -45.0
    pub threshold_db: f32,

    /// Time the level must stay below the threshold before voice ends
    ///
    /// Default: 800ms
    pub silence_timeout_ms: u32,

    /// Audio retained from before a voice onset
    ///
    /// Default: 500ms
    pub pre_roll_ms: u32,

    /// Exponential smoothing factor (0 = no smoothing)
    ///
    /// Default: 0.9
    pub smoothing_factor: f32,

    /// Analysis block length
    ///
    /// Default: 32ms (512 samples at 16kHz)
    pub block_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold_db: -45.0,
            silence_timeout_ms: 800,
            pre_roll_ms: 500,
            smoothing_factor: 0.9,
            block_duration_ms: 32,
        }
    }
}

impl VadConfig {
    /// Samples per analysis block at `sample_rate`
    pub fn block_size(&self, sample_rate: u32) -> usize {
        ((sample_rate as u64 * self.block_duration_ms as u64 / 1000) as usize).max(1)
    }

    /// Number of blocks the pre-roll buffer retains
    pub fn pre_roll_blocks(&self) -> usize {
        pre_roll_capacity(self.pre_roll_ms, self.block_duration_ms as f64)
    }

    /// Check that every field is in range
    pub fn validate(&self) -> Result<(), VadError> {
        if !(-100.0..=0.0).contains(&self.threshold_db) {
            return Err(VadError::InvalidConfig(format!(
                "threshold_db must be within -100..=0, got {}",
                self.threshold_db
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing_factor) {
            return Err(VadError::InvalidConfig(format!(
                "smoothing_factor must be within 0..1, got {}",
                self.smoothing_factor
            )));
        }
        if self.block_duration_ms == 0 || self.block_duration_ms > 1000 {
            return Err(VadError::InvalidConfig(format!(
                "block_duration_ms must be within 1..=1000, got {}",
                self.block_duration_ms
            )));
        }
        Ok(())
    }
}

/// Event emitted by the detector
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VadEvent {
    /// The smoothed level crossed up through the threshold
    VoiceStart {
        /// Audio-clock time of the block that crossed
        timestamp_ms: u64,
        /// Smoothed level at the crossing
        level_db: f32,
    },
    /// The level stayed below the threshold for the whole silence timeout
    VoiceEnd {
        /// Audio-clock time of the block that completed the timeout
        timestamp_ms: u64,
        /// Time from voice start to voice end
        duration_ms: u64,
    },
    /// Per-block level telemetry
    Level(LevelSample),
}

/// Result of analysing one block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAnalysis {
    pub level: LevelSample,
    pub transition: Option<VadEvent>,
}

/// Single-threaded level analyser
///
/// Pure with respect to its inputs: feeding the same block sequence always
/// produces the same events, which is what makes the audio clock testable.
#[derive(Debug)]
pub struct VadAnalyzer {
    config: VadConfig,
    smoother: LevelSmoother,
    voice_active: bool,
    voice_started_ms: u64,
    silence_started_ms: Option<u64>,
    blocks_processed: u64,
    pre_roll: PreRollBuffer,
}

impl VadAnalyzer {
    pub fn new(config: VadConfig) -> Self {
        // Sized for speech-rate audio until `prepare` knows the stream rate
        let pre_roll = PreRollBuffer::new(config.pre_roll_blocks(), config.block_size(16_000));
        Self {
            smoother: LevelSmoother::new(config.smoothing_factor),
            config,
            voice_active: false,
            voice_started_ms: 0,
            silence_started_ms: None,
            blocks_processed: 0,
            pre_roll,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Audio-clock time of the next block
    pub fn clock_ms(&self) -> u64 {
        self.blocks_processed * self.config.block_duration_ms as u64
    }

    /// Buffered pre-roll blocks, oldest first
    pub fn pre_roll_snapshot(&self) -> Vec<AudioBlock> {
        self.pre_roll.snapshot()
    }

    /// Analyse one block of mono samples
    pub fn process_block(&mut self, samples: &[f32], sample_rate: u32) -> BlockAnalysis {
        self.pre_roll.push(samples, sample_rate, self.clock_ms());
        let rms = calculate_rms(samples);
        self.process_level(rms_to_db(rms), rms)
    }

    /// Analyse one block given its already-measured level
    pub fn process_level(&mut self, sample_db: f32, rms: f32) -> BlockAnalysis {
        let timestamp_ms = self.clock_ms();
        let smoothed = self.smoother.update(sample_db);
        let transition = self.update_voice_state(smoothed, timestamp_ms);
        self.blocks_processed += 1;

        BlockAnalysis {
            level: LevelSample {
                db: smoothed,
                rms,
                timestamp_ms,
            },
            transition,
        }
    }

    fn update_voice_state(&mut self, smoothed_db: f32, timestamp_ms: u64) -> Option<VadEvent> {
        if smoothed_db >= self.config.threshold_db {
            self.silence_started_ms = None;
            if self.voice_active {
                return None;
            }
            self.voice_active = true;
            self.voice_started_ms = timestamp_ms;
            return Some(VadEvent::VoiceStart {
                timestamp_ms,
                level_db: smoothed_db,
            });
        }

        if !self.voice_active {
            return None;
        }

        let silence_started = *self.silence_started_ms.get_or_insert(timestamp_ms);
        if timestamp_ms - silence_started < self.config.silence_timeout_ms as u64 {
            return None;
        }

        self.voice_active = false;
        self.silence_started_ms = None;
        Some(VadEvent::VoiceEnd {
            timestamp_ms,
            duration_ms: timestamp_ms - self.voice_started_ms,
        })
    }

    /// Reset, and size the pre-roll blocks for `sample_rate` so analysis
    /// never allocates
    pub fn prepare(&mut self, sample_rate: u32) {
        self.reset();
        self.pre_roll.prepare(self.config.block_size(sample_rate));
    }

    /// Return to the initial state: level at the floor, clock at zero,
    /// pre-roll empty
    pub fn reset(&mut self) {
        self.smoother.reset();
        self.voice_active = false;
        self.voice_started_ms = 0;
        self.silence_started_ms = None;
        self.blocks_processed = 0;
        self.pre_roll.clear();
    }
}

/// VAD-specific errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VadError {
    /// Configuration out of range
    #[error("Invalid VAD configuration: {0}")]
    InvalidConfig(String),

    /// A processing strategy cannot run on this stream
    #[error("{strategy} processing unavailable: {reason}")]
    StrategyUnavailable {
        strategy: &'static str,
        reason: String,
    },

    /// Neither processing strategy could attach
    #[error("Failed to attach voice activity detection: {0}")]
    AttachFailed(String),

    /// `start` called while already attached
    #[error("Voice activity detection already attached")]
    AlreadyAttached,
}
