//! PCM source readers
//!
//! One thread per source reads raw interleaved S32_LE stereo frames in
//! block-sized chunks and deposits them into the channel buffer store.
//! A short read is end of source: the partial block is dropped, the store is
//! told the source finished, and the thread exits. Other sources and the
//! pump coordinator keep running.

mod reader;

pub use reader::{spawn_reader, PcmSourceReader, SourceEnd, SourceSummary};

use thiserror::Error;

use crate::store::StoreError;

/// Errors that end a source reader
#[derive(Debug, Error)]
pub enum SourceError {
    /// Failed to open the source file
    #[error("Failed to open source '{path}': {reason}")]
    OpenFailed { path: String, reason: String },

    /// Read error other than a short read
    #[error("Read error on source {index}: {error}")]
    Read {
        index: usize,
        #[source]
        error: std::io::Error,
    },

    /// The store rejected the block (shutdown, bad binding)
    #[error("Store rejected block from source {index}: {error}")]
    Store {
        index: usize,
        #[source]
        error: StoreError,
    },

    /// Failed to spawn the reader thread
    #[error("Failed to spawn reader thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;
