//! Processing engine interface
//!
//! The signal-processing graph is an external collaborator. The pipeline only
//! talks to it through [`ProcessingEngine`]: import one block per input
//! channel, pump the whole graph once, export one block per output channel,
//! and get/set named parameters by control handle.
//!
//! # Threading
//!
//! Every method takes `&self`. The pump coordinator drives the audio entry
//! points while the control channel handler calls the parameter entry points
//! from its own thread; implementations provide their own synchronisation.
//!
//! # Backends
//!
//! - [`MixdownEngine`]: built-in routing/gain graph, always available
//! - `PdEngine`: Pure Data patches via libpd (feature `pd-engine`)

mod error;
mod mixdown;
mod params;
#[cfg(feature = "pd-engine")]
mod pd;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{
    Sample, DEFAULT_BLOCK_SIZE, DEFAULT_INPUT_CHANNELS, DEFAULT_OUTPUT_CHANNELS,
    DEFAULT_SAMPLE_RATE,
};

pub use error::{EngineError, EngineResult};
pub use mixdown::{
    MixdownEngine, MixdownGraph, Route, DEFAULT_GAIN_HANDLE, DEFAULT_MUTE_HANDLE,
};
#[cfg(feature = "pd-engine")]
pub use pd::{PdEngine, PdReceiver};

/// Opaque identifier of a tunable parameter inside the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlHandle(pub u32);

impl std::fmt::Display for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Channel counts and timing an engine was configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLayout {
    pub input_channels: usize,
    pub output_channels: usize,
    /// Fundamental block size in frames per channel
    pub block_size: usize,
    pub sample_rate: u32,
}

impl Default for EngineLayout {
    fn default() -> Self {
        Self {
            input_channels: DEFAULT_INPUT_CHANNELS,
            output_channels: DEFAULT_OUTPUT_CHANNELS,
            block_size: DEFAULT_BLOCK_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl std::fmt::Display for EngineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in / {} out, {} frames @ {}Hz",
            self.input_channels, self.output_channels, self.block_size, self.sample_rate
        )
    }
}

/// Call-level interface to a block-based processing graph
pub trait ProcessingEngine: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Channel counts and block size this engine was built for
    fn layout(&self) -> EngineLayout;

    /// Load the graph definition at `path`, replacing any loaded graph
    ///
    /// A malformed definition fails with [`EngineError::GraphParse`] or
    /// [`EngineError::GraphRejected`], locating the first invalid entry.
    fn load_graph(&self, path: &Path) -> EngineResult<()>;

    fn is_graph_loaded(&self) -> bool;

    /// Hand one block of `layout().block_size` samples to input `channel`
    fn import_block(&self, channel: usize, samples: &[Sample]) -> EngineResult<()>;

    /// Run the whole graph synchronously for one block
    fn pump(&self) -> EngineResult<()>;

    /// Copy one block of output `channel` into `dest`
    fn export_block(&self, channel: usize, dest: &mut [Sample]) -> EngineResult<()>;

    /// Write `values` into the parameter behind `handle`, starting at `offset`
    fn set_parameter(&self, handle: ControlHandle, values: &[f32], offset: usize)
        -> EngineResult<()>;

    /// Read `dest.len()` values of the parameter behind `handle`, starting at `offset`
    fn get_parameter(&self, handle: ControlHandle, dest: &mut [f32], offset: usize)
        -> EngineResult<()>;
}

/// Check a block length against the engine layout
pub(crate) fn check_block(layout: &EngineLayout, len: usize) -> EngineResult<()> {
    if len != layout.block_size {
        return Err(EngineError::SizeMismatch {
            expected: layout.block_size,
            actual: len,
        });
    }
    Ok(())
}

/// Check a channel index against a channel count
pub(crate) fn check_channel(channel: usize, channels: usize) -> EngineResult<()> {
    if channel >= channels {
        return Err(EngineError::ChannelOutOfRange { channel, channels });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_handle_display() {
        assert_eq!(ControlHandle(0x07531008).to_string(), "0x07531008");
    }

    #[test]
    fn test_default_layout() {
        let layout = EngineLayout::default();
        assert_eq!(layout.input_channels, 4);
        assert_eq!(layout.output_channels, 2);
        assert_eq!(layout.block_size, 768);
        assert_eq!(layout.sample_rate, 48000);
    }

    #[test]
    fn test_block_checks() {
        let layout = EngineLayout::default();
        assert!(check_block(&layout, 768).is_ok());
        assert!(matches!(
            check_block(&layout, 10),
            Err(EngineError::SizeMismatch { expected: 768, actual: 10 })
        ));
        assert!(matches!(
            check_channel(4, 4),
            Err(EngineError::ChannelOutOfRange { channel: 4, channels: 4 })
        ));
    }
}
