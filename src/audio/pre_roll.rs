//! Bounded pre-roll buffer of recent audio blocks
//!
//! Keeps the last `ceil(pre_roll_ms / block_duration_ms)` blocks so a caller
//! can recover the audio that preceded a detected speech onset.

use serde::Serialize;
use std::collections::VecDeque;

/// A block of mono samples captured at a known audio-clock time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioBlock {
    /// Mono samples normalised to [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Audio-clock time of the first sample, in milliseconds
    pub timestamp_ms: u64,
}

/// Number of blocks needed to cover `pre_roll_ms`
pub fn pre_roll_capacity(pre_roll_ms: u32, block_duration_ms: f64) -> usize {
    if block_duration_ms <= 0.0 {
        return 0;
    }
    (pre_roll_ms as f64 / block_duration_ms).ceil() as usize
}

/// Ring of recent blocks
///
/// Every block is allocated up front and recycled through a spare pool, so
/// once [`PreRollBuffer::prepare`] has sized them for the stream, pushes from
/// the audio thread never allocate.
#[derive(Debug)]
pub struct PreRollBuffer {
    blocks: VecDeque<AudioBlock>,
    spare: Vec<AudioBlock>,
    capacity: usize,
}

impl PreRollBuffer {
    /// Create an empty buffer of `capacity` blocks of `block_samples` each
    pub fn new(capacity: usize, block_samples: usize) -> Self {
        let spare = (0..capacity)
            .map(|_| AudioBlock {
                samples: Vec::with_capacity(block_samples),
                sample_rate: 0,
                timestamp_ms: 0,
            })
            .collect();
        Self {
            blocks: VecDeque::with_capacity(capacity),
            spare,
            capacity,
        }
    }

    /// Number of blocks currently retained
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no blocks are retained
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Empty the buffer and make every block hold `block_samples` without
    /// growing
    pub fn prepare(&mut self, block_samples: usize) {
        self.clear();
        for block in &mut self.spare {
            block.samples.reserve(block_samples);
        }
    }

    /// Append a block, evicting the oldest when full
    pub fn push(&mut self, samples: &[f32], sample_rate: u32, timestamp_ms: u64) {
        let recycled = if self.blocks.len() >= self.capacity {
            self.blocks.pop_front()
        } else {
            self.spare.pop()
        };
        let Some(mut block) = recycled else {
            return;
        };

        block.samples.clear();
        block.samples.extend_from_slice(samples);
        block.sample_rate = sample_rate;
        block.timestamp_ms = timestamp_ms;
        self.blocks.push_back(block);
    }

    /// Copy out the retained blocks, oldest first
    pub fn snapshot(&self) -> Vec<AudioBlock> {
        self.blocks.iter().cloned().collect()
    }

    /// Drop every retained block, keeping its storage for reuse
    pub fn clear(&mut self) {
        self.spare.extend(self.blocks.drain(..));
    }
}
