//! Pipeline event notification
//!
//! Threads in the pipeline report lifecycle events through a
//! [`PipelineListener`]. Every method has a no-op default so a listener only
//! implements what it cares about. Calls come from the audio and reader
//! threads, so implementations must not block.

use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::engine::EngineError;

/// Why the pump coordinator stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The store was shut down from outside
    Shutdown,
    /// Every source finished (silence policy only)
    SourcesExhausted,
    /// A device write failed and recovery failed too
    DeviceFailed,
    /// The channel buffer store became unusable
    StoreFailed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StopReason::Shutdown => "shutdown",
            StopReason::SourcesExhausted => "all sources finished",
            StopReason::DeviceFailed => "output device failed",
            StopReason::StoreFailed => "buffer store failed",
        };
        f.write_str(text)
    }
}

/// A failed device write and what recovery did about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrunEvent {
    /// Block index whose write failed
    pub block: u64,
    pub error: String,
    pub recovered: bool,
}

/// Receives pipeline lifecycle events
pub trait PipelineListener: Send + Sync {
    fn audio_started(&self) {}

    /// Called exactly once when the pump coordinator exits
    fn audio_stopped(&self, _reason: StopReason) {}

    fn xrun(&self, _event: &XrunEvent) {}

    fn source_finished(&self, _index: usize, _blocks: u64) {}

    /// An engine call failed on the audio path; the block was replaced by silence
    fn engine_error(&self, _error: &EngineError) {}
}

/// Default listener: everything goes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl PipelineListener for LogListener {
    fn audio_started(&self) {
        log::info!("Audio started");
    }

    fn audio_stopped(&self, reason: StopReason) {
        match reason {
            StopReason::DeviceFailed | StopReason::StoreFailed => {
                log::error!("Audio stopped: {}", reason)
            }
            _ => log::info!("Audio stopped: {}", reason),
        }
    }

    fn xrun(&self, event: &XrunEvent) {
        if event.recovered {
            log::warn!("Xrun at block {} ({}), recovered", event.block, event.error);
        } else {
            log::error!("Xrun at block {} ({}), recovery failed", event.block, event.error);
        }
    }

    fn source_finished(&self, index: usize, blocks: u64) {
        log::info!("Source {} finished after {} blocks", index, blocks);
    }

    fn engine_error(&self, error: &EngineError) {
        log::warn!("Engine error on audio path: {}", error);
    }
}

/// Owned copy of a listener call
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    AudioStarted,
    AudioStopped(StopReason),
    Xrun(XrunEvent),
    SourceFinished { index: usize, blocks: u64 },
    EngineError(String),
}

/// Forwards every event over a crossbeam channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: Sender<PipelineEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: PipelineEvent) {
        // Receiver gone means nobody is watching anymore
        let _ = self.tx.send(event);
    }
}

impl PipelineListener for ChannelListener {
    fn audio_started(&self) {
        self.send(PipelineEvent::AudioStarted);
    }

    fn audio_stopped(&self, reason: StopReason) {
        self.send(PipelineEvent::AudioStopped(reason));
    }

    fn xrun(&self, event: &XrunEvent) {
        self.send(PipelineEvent::Xrun(event.clone()));
    }

    fn source_finished(&self, index: usize, blocks: u64) {
        self.send(PipelineEvent::SourceFinished { index, blocks });
    }

    fn engine_error(&self, error: &EngineError) {
        self.send(PipelineEvent::EngineError(error.to_string()));
    }
}

/// Fans each event out to several listeners in order
#[derive(Default, Clone)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn PipelineListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl PipelineListener for ListenerSet {
    fn audio_started(&self) {
        self.listeners.iter().for_each(|l| l.audio_started());
    }

    fn audio_stopped(&self, reason: StopReason) {
        self.listeners.iter().for_each(|l| l.audio_stopped(reason));
    }

    fn xrun(&self, event: &XrunEvent) {
        self.listeners.iter().for_each(|l| l.xrun(event));
    }

    fn source_finished(&self, index: usize, blocks: u64) {
        self.listeners
            .iter()
            .for_each(|l| l.source_finished(index, blocks));
    }

    fn engine_error(&self, error: &EngineError) {
        self.listeners.iter().for_each(|l| l.engine_error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_listener_forwards_events() {
        let (listener, events) = ChannelListener::new();
        listener.audio_started();
        listener.source_finished(1, 42);
        listener.engine_error(&EngineError::NoGraphLoaded);
        listener.audio_stopped(StopReason::Shutdown);

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                PipelineEvent::AudioStarted,
                PipelineEvent::SourceFinished { index: 1, blocks: 42 },
                PipelineEvent::EngineError("No graph loaded".to_string()),
                PipelineEvent::AudioStopped(StopReason::Shutdown),
            ]
        );
    }

    #[test]
    fn test_channel_listener_survives_dropped_receiver() {
        let (listener, events) = ChannelListener::new();
        drop(events);
        listener.audio_started();
    }

    #[test]
    fn test_listener_set_fans_out() {
        let (a, rx_a) = ChannelListener::new();
        let (b, rx_b) = ChannelListener::new();
        let set = ListenerSet::new()
            .with(Arc::new(LogListener))
            .with(Arc::new(a))
            .with(Arc::new(b));

        set.xrun(&XrunEvent {
            block: 3,
            error: "Output underrun".to_string(),
            recovered: true,
        });
        assert!(matches!(rx_a.try_recv(), Ok(PipelineEvent::Xrun(e)) if e.block == 3));
        assert!(matches!(rx_b.try_recv(), Ok(PipelineEvent::Xrun(e)) if e.recovered));
    }
}
