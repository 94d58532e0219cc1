//! Channel buffer store error types

use thiserror::Error;

/// Errors returned by the channel buffer store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Block size of zero frames
    #[error("Fundamental block size must be greater than zero")]
    ZeroBlockSize,

    /// No source bindings were configured
    #[error("At least one source binding is required")]
    NoSources,

    /// A binding refers to a channel outside the store
    #[error("Channel {channel} is out of range (store has {channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },

    /// Two bindings (or both halves of one binding) feed the same channel
    #[error("Channel {0} is bound more than once")]
    DuplicateChannel(usize),

    /// Source index outside the configured bindings
    #[error("Source {index} is out of range ({sources} sources configured)")]
    SourceOutOfRange { index: usize, sources: usize },

    /// Caller handed over a buffer of the wrong length
    #[error("Expected {expected} samples, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    /// A finished source tried to deposit another block
    #[error("Source {0} has already reached end of source")]
    SourceFinished(usize),

    /// Every source has finished and no block is left to consume
    #[error("Every source has reached end of source")]
    Exhausted,

    /// The store was shut down while waiting
    #[error("Channel buffer store has been shut down")]
    Shutdown,

    /// A thread panicked while holding the store lock
    #[error("Channel buffer store lock poisoned")]
    Poisoned,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
