//! Raw PCM sink
//!
//! Writes frames as headerless S32_LE, the same layout the sources use, so
//! the output can be piped into `aplay -f S32_LE -c 2 -r 48000`.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::Path;

use super::{frame_count, DeviceError, DeviceResult, OutputDevice};
use crate::types::{Sample, SAMPLE_BYTES};

pub struct FileSink<W: Write + Send> {
    label: String,
    channels: usize,
    writer: W,
    bytes: Vec<u8>,
    frames_written: u64,
}

impl FileSink<BufWriter<File>> {
    /// Create (or truncate) a raw PCM file
    pub fn create(path: &Path, channels: usize) -> DeviceResult<Self> {
        let file = File::create(path)?;
        log::info!("FileSink: writing {} channels to {}", channels, path.display());
        Ok(Self::new(path.display().to_string(), BufWriter::new(file), channels))
    }
}

impl FileSink<io::Stdout> {
    pub fn stdout(channels: usize) -> Self {
        log::info!("FileSink: writing {} channels to stdout", channels);
        Self::new("stdout".to_string(), io::stdout(), channels)
    }
}

impl<W: Write + Send> FileSink<W> {
    pub fn new(label: String, writer: W, channels: usize) -> Self {
        Self {
            label,
            channels,
            writer,
            bytes: Vec::new(),
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputDevice for FileSink<W> {
    fn name(&self) -> String {
        format!("file:{}", self.label)
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write_interleaved(&mut self, samples: &[Sample]) -> DeviceResult<usize> {
        let frames = frame_count(samples.len(), self.channels)?;

        self.bytes.clear();
        self.bytes.reserve(samples.len() * SAMPLE_BYTES);
        for s in samples {
            self.bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.writer.write_all(&self.bytes)?;

        self.frames_written += frames as u64;
        Ok(frames)
    }

    fn recover(&mut self, error: &DeviceError) -> DeviceResult<()> {
        match error {
            DeviceError::Io(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) =>
            {
                log::warn!("FileSink {}: retrying after {}", self.label, e);
                Ok(())
            }
            DeviceError::Underrun => Ok(()),
            other => Err(DeviceError::Unrecoverable(other.to_string())),
        }
    }

    fn drain(&mut self) -> DeviceResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
