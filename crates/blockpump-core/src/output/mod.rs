//! Output devices
//!
//! The pump coordinator owns exactly one [`OutputDevice`] and hands it one
//! interleaved block per pump cycle. A failed write gets one call to
//! [`OutputDevice::recover`]; if that fails too the coordinator stops.
//!
//! # Backends
//!
//! - [`FileSink`]: raw S32_LE frames to a file, pipe or stdout
//! - `CpalOutputDevice`: system audio device via cpal (feature `cpal-output`)

mod error;
mod file_sink;

#[cfg(feature = "cpal-output")]
mod cpal_device;
#[cfg(feature = "cpal-output")]
mod device;

pub use error::{DeviceError, DeviceResult};
pub use file_sink::FileSink;

#[cfg(feature = "cpal-output")]
pub use cpal_device::{open_cpal_output, CpalOutputDevice, CpalStreamHandle};
#[cfg(feature = "cpal-output")]
pub use device::{find_output_device, list_output_devices, AudioDevice};

use serde::{Deserialize, Serialize};

use crate::types::Sample;

/// Blocking sink for interleaved frames
pub trait OutputDevice: Send {
    /// Short description for logs
    fn name(&self) -> String;

    /// Number of interleaved channels per frame
    fn channels(&self) -> usize;

    /// Write whole frames, blocking until the device accepted them
    ///
    /// Returns the number of frames written.
    fn write_interleaved(&mut self, samples: &[Sample]) -> DeviceResult<usize>;

    /// Bring the device back to a writable state after `error`
    fn recover(&mut self, error: &DeviceError) -> DeviceResult<()>;

    /// Flush pending frames before shutdown
    fn drain(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}

impl OutputDevice for Box<dyn OutputDevice> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn write_interleaved(&mut self, samples: &[Sample]) -> DeviceResult<usize> {
        (**self).write_interleaved(samples)
    }

    fn recover(&mut self, error: &DeviceError) -> DeviceResult<()> {
        (**self).recover(error)
    }

    fn drain(&mut self) -> DeviceResult<()> {
        (**self).drain()
    }
}

/// Identifies an audio device, optionally on a specific host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Device name as reported by the host
    pub name: String,
    /// Host backend ("ALSA", "JACK", ...); any host when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
        }
    }

    pub fn with_host(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: Some(host.into()),
        }
    }

    /// Parse `HOST:name` or a bare device name
    ///
    /// ALSA names such as `hw:0,0` contain a colon too, so the prefix only
    /// counts when it names a known host.
    pub fn parse(label: &str) -> Self {
        const HOSTS: [&str; 6] = ["ALSA", "JACK", "PulseAudio", "CoreAudio", "WASAPI", "ASIO"];
        match label.split_once(':') {
            Some((host, name)) if HOSTS.contains(&host) => Self::with_host(name, host),
            _ => Self::new(label),
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Some(host) => write!(f, "[{}] {}", host, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Frames in an interleaved buffer, rejecting partial frames
pub(crate) fn frame_count(samples: usize, channels: usize) -> DeviceResult<usize> {
    if channels == 0 || samples % channels != 0 {
        return Err(DeviceError::PartialFrame { samples, channels });
    }
    Ok(samples / channels)
}
