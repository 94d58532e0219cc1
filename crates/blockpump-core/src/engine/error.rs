//! Error types for processing engine calls
//!
//! Covers the documented failure codes of the engine entry points: not
//! initialised, no graph loaded, bad handle, size mismatch, and graph
//! definitions rejected at load time.

use std::path::PathBuf;
use thiserror::Error;

use super::ControlHandle;

/// Errors that can occur during engine calls
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine backend failed to start
    #[error("Failed to initialize engine: {0}")]
    InitializationFailed(String),

    /// Engine is not running (audio inactive or released)
    #[error("Engine is not initialized")]
    NotInitialized,

    /// Audio entry point called before a graph was loaded
    #[error("No graph loaded")]
    NoGraphLoaded,

    /// Graph file does not exist
    #[error("Graph file not found: {0}")]
    GraphNotFound(PathBuf),

    /// Graph file is not well-formed
    #[error("Failed to parse graph '{path}' at byte {offset}: {reason}")]
    GraphParse {
        path: PathBuf,
        offset: usize,
        reason: String,
    },

    /// Graph file parsed but an entry is invalid for this engine
    #[error("Graph '{path}' rejected at entry {entry}: {reason}")]
    GraphRejected {
        path: PathBuf,
        entry: usize,
        reason: String,
    },

    /// Unknown control handle
    #[error("Invalid control handle {0}")]
    InvalidHandle(ControlHandle),

    /// Buffer or parameter length does not match
    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Channel index outside the engine layout
    #[error("Channel {channel} out of range ({channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },

    /// Backend-specific failure
    #[error("Engine backend error: {0}")]
    Backend(String),

    /// IO error while reading a graph file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A thread panicked while holding engine state
    #[error("Engine state lock poisoned")]
    Poisoned,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::GraphParse {
            path: PathBuf::from("/tmp/graph.yaml"),
            offset: 42,
            reason: "bad".to_string(),
        };
        assert!(err.to_string().contains("byte 42"));

        let err = EngineError::InvalidHandle(ControlHandle(0x8753100C));
        assert!(err.to_string().contains("0x8753100C"));
    }
}
