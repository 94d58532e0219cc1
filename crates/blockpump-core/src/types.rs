//! Common types for blockpump
//!
//! Sample format, fundamental constants and the source-to-channel binding
//! shared by the store, the readers and the pump coordinator.

use serde::{Deserialize, Serialize};

/// Default sample rate of the pipeline (48kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default fundamental block size in frames per channel
pub const DEFAULT_BLOCK_SIZE: usize = 768;

/// Default number of engine input channels (two stereo sources)
pub const DEFAULT_INPUT_CHANNELS: usize = 4;

/// Default number of engine output channels (stereo playback)
pub const DEFAULT_OUTPUT_CHANNELS: usize = 2;

/// Number of interleaved channels carried by one PCM source
pub const CHANNELS_PER_SOURCE: usize = 2;

/// Audio sample type: signed 32-bit fixed point, little-endian on the wire
pub type Sample = i32;

/// Size of one sample on the wire in bytes
pub const SAMPLE_BYTES: usize = std::mem::size_of::<Sample>();

/// Full-scale value used when converting between fixed point and float
pub const FULL_SCALE: f32 = 2_147_483_648.0;

/// Convert a fixed-point sample to a float in [-1.0, 1.0)
#[inline]
pub fn sample_to_f32(sample: Sample) -> f32 {
    sample as f32 / FULL_SCALE
}

/// Convert a float sample back to fixed point, saturating out-of-range values
#[inline]
pub fn f32_to_sample(value: f32) -> Sample {
    // `as` saturates on overflow and maps NaN to 0
    (value * FULL_SCALE) as Sample
}

/// Maps one physical two-channel source to the logical channels it feeds
///
/// Immutable once the store is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBinding {
    /// Logical channel fed by the first interleaved sample of each frame
    pub left: usize,
    /// Logical channel fed by the second interleaved sample of each frame
    pub right: usize,
}

impl SourceBinding {
    pub fn new(left: usize, right: usize) -> Self {
        Self { left, right }
    }

    /// Binding used when sources are listed in order: source `n` feeds `(2n, 2n+1)`
    pub fn sequential(source_index: usize) -> Self {
        let left = source_index * CHANNELS_PER_SOURCE;
        Self {
            left,
            right: left + 1,
        }
    }

    /// Both channels fed by this source
    pub fn channels(&self) -> [usize; CHANNELS_PER_SOURCE] {
        [self.left, self.right]
    }
}

impl std::fmt::Display for SourceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}/ch{}", self.left, self.right)
    }
}
