//! Pump coordinator
//!
//! The audio thread and the heartbeat of the pipeline. Each cycle:
//!
//! 1. wait until every channel holds a block and take a copy of all of them
//! 2. import each channel into the engine
//! 3. pump the engine once
//! 4. export every output channel and interleave
//! 5. write the interleaved block to the output device
//!
//! The store lock is only held for step 1; engine and device calls run
//! without it.

mod coordinator;
mod listener;

pub use coordinator::{spawn_coordinator, CycleOutcome, PumpCoordinator, PumpSummary};
pub use listener::{
    ChannelListener, ListenerSet, LogListener, PipelineEvent, PipelineListener, StopReason,
    XrunEvent,
};

use thiserror::Error;

use crate::store::StoreError;

/// Errors that stop or prevent a pump coordinator
#[derive(Debug, Error)]
pub enum PumpError {
    /// Engine, store and device disagree on a dimension
    #[error("Layout mismatch: {what} is {actual}, expected {expected}")]
    LayoutMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The engine has no graph to pump
    #[error("Engine '{0}' has no graph loaded")]
    GraphNotLoaded(String),

    /// The channel buffer store failed
    #[error("Buffer store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to spawn the coordinator thread
    #[error("Failed to spawn pump coordinator: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for pump operations
pub type PumpResult<T> = Result<T, PumpError>;
