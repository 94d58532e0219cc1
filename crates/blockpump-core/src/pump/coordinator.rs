//! Pump cycle driver

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::engine::{EngineResult, ProcessingEngine};
use crate::output::{DeviceError, OutputDevice};
use crate::store::{ChannelBufferStore, StoreError};
use crate::types::Sample;

use super::{PipelineListener, PumpError, PumpResult, StopReason, XrunEvent};

/// Result of one pump cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Block written to the device
    Written,
    /// Write failed but the device recovered; the block was dropped
    Recovered,
    /// Coordinator must stop
    Stop(StopReason),
}

/// What a finished coordinator did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSummary {
    /// Blocks taken from the store
    pub cycles: u64,
    /// Blocks that reached the device
    pub blocks_written: u64,
    pub xruns: u64,
    /// Cycles that output silence because of an engine error
    pub engine_errors: u64,
    pub reason: StopReason,
}

/// Moves blocks from the store through the engine to the device
pub struct PumpCoordinator<D: OutputDevice> {
    store: Arc<ChannelBufferStore>,
    engine: Arc<dyn ProcessingEngine>,
    device: D,
    listener: Arc<dyn PipelineListener>,
    /// One block per input channel, copied out of the store
    inputs: Vec<Vec<Sample>>,
    /// One block per engine output channel
    outputs: Vec<Vec<Sample>>,
    interleaved: Vec<Sample>,
    cycles: u64,
    blocks_written: u64,
    xruns: u64,
    engine_errors: u64,
}

impl<D: OutputDevice> PumpCoordinator<D> {
    /// Check that store, engine and device agree, and allocate cycle buffers
    pub fn new(
        store: Arc<ChannelBufferStore>,
        engine: Arc<dyn ProcessingEngine>,
        device: D,
        listener: Arc<dyn PipelineListener>,
    ) -> PumpResult<Self> {
        let layout = engine.layout();
        let checks = [
            ("engine block size", store.block_size(), layout.block_size),
            ("engine input channels", store.channel_count(), layout.input_channels),
            ("device channels", layout.output_channels, device.channels()),
        ];
        for (what, expected, actual) in checks {
            if expected != actual {
                return Err(PumpError::LayoutMismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }
        if !engine.is_graph_loaded() {
            return Err(PumpError::GraphNotLoaded(engine.name().to_string()));
        }

        let block = layout.block_size;
        Ok(Self {
            inputs: vec![vec![0; block]; layout.input_channels],
            outputs: vec![vec![0; block]; layout.output_channels],
            interleaved: vec![0; block * layout.output_channels],
            store,
            engine,
            device,
            listener,
            cycles: 0,
            blocks_written: 0,
            xruns: 0,
            engine_errors: 0,
        })
    }

    /// Run one pump cycle
    pub fn run_cycle(&mut self) -> PumpResult<CycleOutcome> {
        let block = match self.store.take_block(&mut self.inputs) {
            Ok(block) => block,
            Err(StoreError::Shutdown) => return Ok(CycleOutcome::Stop(StopReason::Shutdown)),
            Err(StoreError::Exhausted) => {
                return Ok(CycleOutcome::Stop(StopReason::SourcesExhausted))
            }
            Err(e) => return Err(e.into()),
        };
        self.cycles += 1;

        if let Err(e) = self.process() {
            self.engine_errors += 1;
            self.listener.engine_error(&e);
            for out in self.outputs.iter_mut() {
                out.fill(0);
            }
        }
        self.interleave();

        match self.device.write_interleaved(&self.interleaved) {
            Ok(_) => {
                self.blocks_written += 1;
                Ok(CycleOutcome::Written)
            }
            Err(e) => Ok(self.handle_write_error(block, e)),
        }
    }

    /// Import, pump, export
    fn process(&mut self) -> EngineResult<()> {
        for (channel, samples) in self.inputs.iter().enumerate() {
            self.engine.import_block(channel, samples)?;
        }
        self.engine.pump()?;
        for (channel, dest) in self.outputs.iter_mut().enumerate() {
            self.engine.export_block(channel, dest)?;
        }
        Ok(())
    }

    fn interleave(&mut self) {
        let channels = self.outputs.len();
        for (channel, block) in self.outputs.iter().enumerate() {
            for (frame, &s) in block.iter().enumerate() {
                self.interleaved[frame * channels + channel] = s;
            }
        }
    }

    /// One recovery attempt; a second failure is fatal
    fn handle_write_error(&mut self, block: u64, error: DeviceError) -> CycleOutcome {
        self.xruns += 1;
        let recovery = self.device.recover(&error);
        let recovered = recovery.is_ok();

        self.listener.xrun(&XrunEvent {
            block,
            error: error.to_string(),
            recovered,
        });

        match recovery {
            Ok(()) => CycleOutcome::Recovered,
            Err(e) => {
                log::error!(
                    "{}: recovery from '{}' failed: {}",
                    self.device.name(),
                    error,
                    e
                );
                CycleOutcome::Stop(StopReason::DeviceFailed)
            }
        }
    }

    /// Run cycles until something stops the pipeline
    pub fn run(mut self) -> PumpResult<PumpSummary> {
        log::info!(
            "Pump coordinator: engine '{}' -> {} ({})",
            self.engine.name(),
            self.device.name(),
            self.engine.layout()
        );
        self.listener.audio_started();

        let result = loop {
            match self.run_cycle() {
                Ok(CycleOutcome::Stop(reason)) => break Ok(reason),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        };

        let reason = match &result {
            Ok(reason) => *reason,
            Err(e) => {
                log::error!("Pump coordinator failed: {}", e);
                StopReason::StoreFailed
            }
        };

        if reason != StopReason::DeviceFailed {
            if let Err(e) = self.device.drain() {
                log::warn!("{}: drain failed: {}", self.device.name(), e);
            }
        }
        self.listener.audio_stopped(reason);

        log::info!(
            "Pump coordinator stopped after {} cycles ({} written, {} xruns, {} engine errors)",
            self.cycles,
            self.blocks_written,
            self.xruns,
            self.engine_errors
        );

        result.map(|reason| PumpSummary {
            cycles: self.cycles,
            blocks_written: self.blocks_written,
            xruns: self.xruns,
            engine_errors: self.engine_errors,
            reason,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

/// Run a coordinator on the `pump-coordinator` thread
pub fn spawn_coordinator<D>(
    coordinator: PumpCoordinator<D>,
) -> PumpResult<JoinHandle<PumpResult<PumpSummary>>>
where
    D: OutputDevice + 'static,
{
    let handle = thread::Builder::new()
        .name("pump-coordinator".to_string())
        .spawn(move || coordinator.run())?;
    Ok(handle)
}
