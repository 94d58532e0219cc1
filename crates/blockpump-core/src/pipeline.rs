//! Pipeline wiring
//!
//! Builds the channel buffer store, checks it against the engine, and starts
//! one reader thread per source plus the pump coordinator thread. The
//! returned [`PipelineHandle`] is the external coordination point: call
//! [`PipelineHandle::shutdown`] to wake every blocked thread, then
//! [`PipelineHandle::join`].

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;

use crate::config::{ConfigError, PipelineConfig};
use crate::control::ControlError;
use crate::engine::{EngineError, ProcessingEngine};
use crate::output::{DeviceError, OutputDevice};
use crate::pump::{spawn_coordinator, PipelineListener, PumpCoordinator, PumpError, PumpResult, PumpSummary};
use crate::source::{spawn_reader, PcmSourceReader, SourceError, SourceResult, SourceSummary};
use crate::store::{ChannelBufferStore, EndOfSourcePolicy, StoreError};
use crate::types::SourceBinding;

/// Anything that can stop the pipeline from starting or finishing cleanly
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Pump(#[from] PumpError),

    #[error(transparent)]
    Control(#[from] ControlError),

    /// Number of source streams differs from the number of bindings
    #[error("Expected {expected} sources, got {actual}")]
    SourceCount { expected: usize, actual: usize },

    #[error("Thread '{0}' panicked")]
    ThreadPanicked(String),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// A configured but not yet running pipeline
pub struct Pipeline {
    store: Arc<ChannelBufferStore>,
    engine: Arc<dyn ProcessingEngine>,
    listener: Arc<dyn PipelineListener>,
}

impl Pipeline {
    pub fn new(
        block_size: usize,
        bindings: Vec<SourceBinding>,
        policy: EndOfSourcePolicy,
        engine: Arc<dyn ProcessingEngine>,
        listener: Arc<dyn PipelineListener>,
    ) -> PipelineResult<Self> {
        let store = Arc::new(ChannelBufferStore::new(block_size, bindings, policy)?);
        log::info!(
            "Pipeline: {} sources, {} channels, {} frames per block, end_of_source={:?}",
            store.source_count(),
            store.channel_count(),
            store.block_size(),
            policy
        );
        Ok(Self {
            store,
            engine,
            listener,
        })
    }

    /// Validate `config` and build the store it describes
    pub fn from_config(
        config: &PipelineConfig,
        engine: Arc<dyn ProcessingEngine>,
        listener: Arc<dyn PipelineListener>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        Self::new(
            config.engine.block_size,
            config.bindings(),
            config.end_of_source,
            engine,
            listener,
        )
    }

    pub fn store(&self) -> &Arc<ChannelBufferStore> {
        &self.store
    }

    /// Open every source file and start
    pub fn start_files<D>(self, paths: &[PathBuf], device: D) -> PipelineResult<PipelineHandle>
    where
        D: OutputDevice + 'static,
    {
        let readers = paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                PcmSourceReader::open(i, path, self.store.clone(), self.listener.clone())
            })
            .collect::<SourceResult<Vec<_>>>()?;
        self.launch(readers, device)
    }

    /// Start with arbitrary byte streams as sources, in binding order
    pub fn start<R, D>(self, sources: Vec<R>, device: D) -> PipelineResult<PipelineHandle>
    where
        R: Read + Send + 'static,
        D: OutputDevice + 'static,
    {
        let readers = sources
            .into_iter()
            .enumerate()
            .map(|(i, input)| {
                PcmSourceReader::new(i, input, self.store.clone(), self.listener.clone())
            })
            .collect::<SourceResult<Vec<_>>>()?;
        self.launch(readers, device)
    }

    fn launch<R, D>(self, readers: Vec<PcmSourceReader<R>>, device: D) -> PipelineResult<PipelineHandle>
    where
        R: Read + Send + 'static,
        D: OutputDevice + 'static,
    {
        if readers.len() != self.store.source_count() {
            return Err(PipelineError::SourceCount {
                expected: self.store.source_count(),
                actual: readers.len(),
            });
        }

        let coordinator = PumpCoordinator::new(
            self.store.clone(),
            self.engine.clone(),
            device,
            self.listener.clone(),
        )?;
        let pump = spawn_coordinator(coordinator)?;

        let mut handle = PipelineHandle {
            store: self.store,
            pump: Some(pump),
            readers: Vec::new(),
        };
        for reader in readers {
            match spawn_reader(reader) {
                Ok(thread) => handle.readers.push(thread),
                Err(e) => {
                    // Reap what was already started
                    handle.abort();
                    return Err(e.into());
                }
            }
        }

        log::info!("Pipeline started");
        Ok(handle)
    }
}

/// Final state of every pipeline thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub pump: PumpSummary,
    /// Reader summaries in source order; failed readers are left out
    pub sources: Vec<SourceSummary>,
}

/// Handle to a running pipeline
pub struct PipelineHandle {
    store: Arc<ChannelBufferStore>,
    pump: Option<JoinHandle<PumpResult<PumpSummary>>>,
    readers: Vec<JoinHandle<SourceResult<SourceSummary>>>,
}

impl PipelineHandle {
    pub fn store(&self) -> &Arc<ChannelBufferStore> {
        &self.store
    }

    /// Wake every blocked reader and the coordinator so they return
    pub fn shutdown(&self) {
        log::info!("Pipeline shutdown requested");
        self.store.shutdown();
    }

    /// Whether the pump coordinator has exited
    pub fn is_finished(&self) -> bool {
        self.pump.as_ref().map_or(true, |p| p.is_finished())
    }

    /// Shut down and join, logging instead of returning a failed join
    pub fn abort(self) -> Option<PipelineReport> {
        self.shutdown();
        match self.join() {
            Ok(report) => Some(report),
            Err(e) => {
                log::warn!("Pipeline: join after abort failed: {}", e);
                None
            }
        }
    }

    /// Wait for the coordinator, then release and join the readers
    ///
    /// Readers blocked inside a source read (a FIFO with no writer, say)
    /// only return once that read does.
    pub fn join(mut self) -> PipelineResult<PipelineReport> {
        let pump = match self.pump.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| PipelineError::ThreadPanicked("pump-coordinator".to_string()))?,
            None => return Err(PipelineError::ThreadPanicked("pump-coordinator".to_string())),
        };

        // A stopped coordinator leaves readers waiting for free slots
        self.store.shutdown();

        let mut sources = Vec::new();
        for (i, reader) in self.readers.drain(..).enumerate() {
            match reader.join() {
                Ok(Ok(summary)) => sources.push(summary),
                Ok(Err(e)) => log::warn!("Source {} failed: {}", i, e),
                Err(_) => log::error!("Reader thread pcm-source-{} panicked", i),
            }
        }

        Ok(PipelineReport {
            pump: pump?,
            sources,
        })
    }
}
