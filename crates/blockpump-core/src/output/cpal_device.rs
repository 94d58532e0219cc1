//! cpal output backend
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  write_interleaved  ┌─────────────────────┐
//! │ Pump Coordinator │────push(f32)───────►│    Sample Ring      │
//! │ (blocking write) │                     │  (lock-free SPSC)   │
//! └──────────────────┘                     └──────────┬──────────┘
//!         ▲                                           │ pop()
//!         │ underrun / failed flags                   ▼
//! ┌───────┴──────────┐                     ┌─────────────────────┐
//! │   StreamShared   │◄────────────────────│  cpal Audio Thread  │
//! │    (atomics)     │                     │  (device callback)  │
//! └──────────────────┘                     └─────────────────────┘
//! ```
//!
//! `cpal::Stream` is not `Send` on every platform, so opening the device
//! yields two halves: a [`CpalStreamHandle`] that keeps the stream alive on
//! the opening thread, and a `Send` [`CpalOutputDevice`] the pump
//! coordinator writes into. Writes block while the ring is full, which is
//! what paces the pipeline to the device clock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use super::device::find_output_device;
use super::{frame_count, DeviceError, DeviceId, DeviceResult, OutputDevice};
use crate::types::{sample_to_f32, Sample};

/// Poll interval while waiting for ring space
const WRITE_POLL: Duration = Duration::from_millis(1);

/// A write that makes no progress for this long fails
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Flags shared between the writer and the device callback
#[derive(Default)]
struct StreamShared {
    /// Callback ran dry since the last write
    underrun: AtomicBool,
    /// Ring has been filled at least once since open/recover
    primed: AtomicBool,
    /// Stream reported an error
    failed: AtomicBool,
    underruns: AtomicU64,
}

/// Keeps the cpal stream alive. Drop this to stop audio.
pub struct CpalStreamHandle {
    _stream: Stream,
    device_name: String,
    sample_rate: u32,
    device_channels: u16,
    shared: Arc<StreamShared>,
}

impl CpalStreamHandle {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn device_channels(&self) -> u16 {
        self.device_channels
    }

    /// Callback periods that found the ring empty
    pub fn underrun_count(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }
}

/// Writer half of a cpal output stream
pub struct CpalOutputDevice {
    name: String,
    channels: usize,
    producer: rtrb::Producer<f32>,
    shared: Arc<StreamShared>,
    stall_timeout: Duration,
}

/// Open a cpal output stream for `channels` interleaved channels
///
/// The ring holds `latency_ms` worth of audio but never less than two
/// blocks.
pub fn open_cpal_output(
    device_id: Option<&DeviceId>,
    channels: usize,
    sample_rate: u32,
    block_size: usize,
    latency_ms: u32,
) -> DeviceResult<(CpalStreamHandle, CpalOutputDevice)> {
    let device = find_output_device(device_id)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let supported = output_config(&device, channels, sample_rate)?;
    let device_channels = supported.channels();

    let latency_frames = (sample_rate as u64 * latency_ms as u64 / 1000) as usize;
    let ring_frames = latency_frames.max(block_size * 2);
    let shared = Arc::new(StreamShared::default());

    let mut stream_config = StreamConfig {
        channels: device_channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: CpalBufferSize::Fixed(block_size as u32),
    };

    log::info!(
        "Audio config: {} device channels ({} used), {}Hz, {} frames, ring {} frames (~{:.1}ms)",
        device_channels,
        channels,
        sample_rate,
        block_size,
        ring_frames,
        ring_frames as f32 * 1000.0 / sample_rate as f32
    );

    let ring_samples = ring_frames * channels;
    let (stream, producer) =
        match build_stream(&device, &stream_config, channels, ring_samples, shared.clone()) {
            Ok(built) => built,
            Err(e) => {
                log::warn!(
                    "Fixed buffer of {} frames rejected ({}), using device default",
                    block_size,
                    e
                );
                stream_config.buffer_size = CpalBufferSize::Default;
                build_stream(&device, &stream_config, channels, ring_samples, shared.clone())?
            }
        };

    stream
        .play()
        .map_err(|e| DeviceError::StreamPlayError(e.to_string()))?;
    log::info!("Audio stream started on {}", device_name);

    let handle = CpalStreamHandle {
        _stream: stream,
        device_name: device_name.clone(),
        sample_rate,
        device_channels,
        shared: shared.clone(),
    };
    let writer = CpalOutputDevice {
        name: format!("cpal:{}", device_name),
        channels,
        producer,
        shared,
        stall_timeout: STALL_TIMEOUT,
    };
    Ok((handle, writer))
}

/// Pick an f32 config with enough channels at exactly `sample_rate`
fn output_config(
    device: &cpal::Device,
    channels: usize,
    sample_rate: u32,
) -> DeviceResult<cpal::SupportedStreamConfig> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| DeviceError::ConfigError(e.to_string()))?
        .collect();

    if supported.is_empty() {
        return Err(DeviceError::ConfigError(
            "No supported output configurations".to_string(),
        ));
    }

    supported
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() as usize >= channels)
        .filter(|c| (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&sample_rate))
        .min_by_key(|c| c.channels())
        .map(|c| c.clone().with_sample_rate(cpal::SampleRate(sample_rate)))
        .ok_or_else(|| {
            DeviceError::ConfigError(format!(
                "No f32 output with {} channels at {}Hz",
                channels, sample_rate
            ))
        })
}

/// Build the output stream together with a fresh sample ring
fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    ring_samples: usize,
    shared: Arc<StreamShared>,
) -> DeviceResult<(Stream, rtrb::Producer<f32>)> {
    let device_channels = config.channels as usize;
    let (producer, mut consumer) = rtrb::RingBuffer::<f32>::new(ring_samples);
    let error_shared = shared.clone();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                fill_from_ring(data, device_channels, channels, &mut consumer, &shared);
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
                error_shared.failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| DeviceError::StreamBuildError(e.to_string()))?;

    Ok((stream, producer))
}

/// Device callback body: copy frames out of the ring, zero-padding extra
/// device channels, and flag an underrun when the ring runs dry
fn fill_from_ring(
    data: &mut [f32],
    device_channels: usize,
    channels: usize,
    consumer: &mut rtrb::Consumer<f32>,
    shared: &StreamShared,
) {
    if !shared.primed.load(Ordering::Acquire) {
        data.fill(0.0);
        return;
    }

    let mut starved = false;
    for frame in data.chunks_mut(device_channels) {
        if consumer.slots() < channels {
            frame.fill(0.0);
            starved = true;
            continue;
        }
        for c in 0..channels {
            let s = consumer.pop().unwrap_or(0.0);
            if let Some(out) = frame.get_mut(c) {
                *out = s;
            }
        }
        for out in frame.iter_mut().skip(channels) {
            *out = 0.0;
        }
    }

    if starved {
        shared.underruns.fetch_add(1, Ordering::Relaxed);
        shared.underrun.store(true, Ordering::Release);
    }
}

impl OutputDevice for CpalOutputDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write_interleaved(&mut self, samples: &[Sample]) -> DeviceResult<usize> {
        let frames = frame_count(samples.len(), self.channels)?;

        if self.shared.failed.load(Ordering::Acquire) {
            return Err(DeviceError::StreamError("stream stopped".to_string()));
        }
        if self.shared.underrun.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::Underrun);
        }

        let mut written = 0;
        let mut last_progress = Instant::now();
        while written < samples.len() {
            let free = self.producer.slots().min(samples.len() - written);
            if free == 0 {
                // A full ring is primed whether or not the block is complete
                self.shared.primed.store(true, Ordering::Release);
                if self.shared.failed.load(Ordering::Acquire) {
                    return Err(DeviceError::StreamError("stream stopped".to_string()));
                }
                if last_progress.elapsed() > self.stall_timeout {
                    return Err(DeviceError::Stalled(self.stall_timeout.as_millis() as u64));
                }
                thread::sleep(WRITE_POLL);
                continue;
            }

            let chunk = self
                .producer
                .write_chunk_uninit(free)
                .map_err(|e| DeviceError::StreamError(e.to_string()))?;
            written += chunk.fill_from_iter(
                samples[written..written + free]
                    .iter()
                    .map(|&s| sample_to_f32(s)),
            );
            last_progress = Instant::now();
        }

        self.shared.primed.store(true, Ordering::Release);
        Ok(frames)
    }

    fn recover(&mut self, error: &DeviceError) -> DeviceResult<()> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(DeviceError::Unrecoverable(format!("stream failed after {}", error)));
        }
        match error {
            DeviceError::Underrun => {
                // Let the ring fill again before the callback resumes reading
                self.shared.primed.store(false, Ordering::Release);
                self.shared.underrun.store(false, Ordering::Release);
                log::warn!("{}: recovered from {}", self.name, error);
                Ok(())
            }
            DeviceError::Stalled(_) => {
                // The callback must free at least one slot, or the device is gone
                self.shared.primed.store(true, Ordering::Release);
                let start = Instant::now();
                while self.producer.slots() == 0 {
                    if self.shared.failed.load(Ordering::Acquire)
                        || start.elapsed() > self.stall_timeout
                    {
                        return Err(DeviceError::Unrecoverable(format!(
                            "ring still full after {}",
                            error
                        )));
                    }
                    thread::sleep(WRITE_POLL);
                }
                log::warn!("{}: recovered from {}", self.name, error);
                Ok(())
            }
            other => Err(DeviceError::Unrecoverable(other.to_string())),
        }
    }

    fn drain(&mut self) -> DeviceResult<()> {
        let capacity = self.producer.buffer().capacity();
        let start = Instant::now();
        while self.producer.slots() < capacity {
            if self.shared.failed.load(Ordering::Acquire) || start.elapsed() > self.stall_timeout {
                break;
            }
            thread::sleep(WRITE_POLL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer over a bare ring; the test plays the device callback
    fn ring_device(ring_samples: usize) -> (CpalOutputDevice, rtrb::Consumer<f32>) {
        let (producer, consumer) = rtrb::RingBuffer::<f32>::new(ring_samples);
        let device = CpalOutputDevice {
            name: "cpal:test".to_string(),
            channels: 2,
            producer,
            shared: Arc::new(StreamShared::default()),
            stall_timeout: Duration::from_millis(20),
        };
        (device, consumer)
    }

    #[test]
    fn test_stall_with_dead_callback_is_unrecoverable() {
        let (mut device, _consumer) = ring_device(8);
        assert_eq!(device.write_interleaved(&[1; 8]).unwrap(), 4);

        let error = device.write_interleaved(&[2; 8]).unwrap_err();
        assert!(matches!(error, DeviceError::Stalled(20)));
        assert!(matches!(
            device.recover(&error),
            Err(DeviceError::Unrecoverable(_))
        ));
    }

    #[test]
    fn test_stall_recovers_once_callback_drains() {
        let (mut device, mut consumer) = ring_device(8);
        device.write_interleaved(&[1; 8]).unwrap();
        let error = device.write_interleaved(&[2; 8]).unwrap_err();

        // Callback resumes and empties the ring
        consumer.read_chunk(8).unwrap().commit_all();
        device.recover(&error).unwrap();
        assert!(device.shared.primed.load(Ordering::Acquire));

        assert_eq!(device.write_interleaved(&[3; 8]).unwrap(), 4);
        assert_eq!(consumer.slots(), 8);
    }

    #[test]
    fn test_full_ring_primes_callback() {
        let (mut device, _consumer) = ring_device(4);
        assert!(device.write_interleaved(&[1; 8]).is_err());
        assert!(device.shared.primed.load(Ordering::Acquire));
    }

    #[test]
    fn test_callback_silent_until_primed() {
        let (mut producer, mut consumer) = rtrb::RingBuffer::<f32>::new(8);
        producer.push(0.5).unwrap();
        producer.push(0.5).unwrap();
        let shared = StreamShared::default();

        let mut data = [1.0f32; 4];
        fill_from_ring(&mut data, 2, 2, &mut consumer, &shared);
        assert_eq!(data, [0.0; 4]);
        assert!(!shared.underrun.load(Ordering::Acquire));
    }

    #[test]
    fn test_callback_flags_underrun_and_pads_channels() {
        let (mut producer, mut consumer) = rtrb::RingBuffer::<f32>::new(8);
        producer.push(0.25).unwrap();
        producer.push(-0.25).unwrap();
        let shared = StreamShared::default();
        shared.primed.store(true, Ordering::Release);

        // Four-channel device, stereo ring, two frames requested, one available
        let mut data = [1.0f32; 8];
        fill_from_ring(&mut data, 4, 2, &mut consumer, &shared);
        assert_eq!(data, [0.25, -0.25, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(shared.underrun.load(Ordering::Acquire));
        assert_eq!(shared.underruns.load(Ordering::Relaxed), 1);
    }
}
