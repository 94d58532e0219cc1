//! Output device error types

use thiserror::Error;

/// Errors that can occur while writing to an output device
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device ran out of samples between two writes
    #[error("Output underrun")]
    Underrun,

    /// Interleaved buffer does not hold whole frames
    #[error("Buffer of {samples} samples is not a whole number of {channels}-channel frames")]
    PartialFrame { samples: usize, channels: usize },

    /// No audio devices available
    #[error("No audio output devices found")]
    NoDevices,

    /// Failed to get default device
    #[error("Failed to get default audio device: {0}")]
    NoDefaultDevice(String),

    /// Device not found
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to negotiate a device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/play stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Stream error during playback
    #[error("Audio stream error: {0}")]
    StreamError(String),

    /// Device did not accept samples in time
    #[error("Output device stalled for {0} ms")]
    Stalled(u64),

    /// Write to a file or pipe failed
    #[error("Output IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Recovery was attempted and did not succeed
    #[error("Recovery failed: {0}")]
    Unrecoverable(String),
}

/// Result type for output device operations
pub type DeviceResult<T> = Result<T, DeviceError>;
