//! PdEngine - Pure Data patches as the processing graph
//!
//! The graph file is a `.pd` patch opened through libpd. Inputs and outputs
//! map to the patch's `adc~`/`dac~` channels. Control handles are bound to
//! receive names; a leading `$0` in a receive name is expanded to the patch
//! instance id so `$0-gain` works the same way it does inside the patch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, Once};

use libpd_rs::functions::receive::on_print;
use libpd_rs::functions::verbose_print_state;
use libpd_rs::{Pd, PdAudioContext};

use super::params::ParameterTable;
use super::{
    check_block, check_channel, ControlHandle, EngineError, EngineLayout, EngineResult,
    ProcessingEngine,
};
use crate::types::{f32_to_sample, sample_to_f32, Sample};

/// libpd always runs in ticks of this many frames
const PD_TICK_FRAMES: usize = 64;

static PRINT_HOOK_INIT: Once = Once::new();

/// Route Pd console output to the log (once per process)
fn init_print_hook() {
    PRINT_HOOK_INIT.call_once(|| {
        verbose_print_state(true);

        on_print(|msg: &str| {
            let msg = msg.trim();
            if msg.is_empty() {
                return;
            }

            if msg.contains("error") || msg.contains("can't") || msg.contains("couldn't") {
                log::error!("[PD] {}", msg);
            } else if msg.contains("warning") || msg.contains("deprecated") {
                log::warn!("[PD] {}", msg);
            } else {
                log::info!("[PD] {}", msg);
            }
        });

        log::debug!("PD print hook initialized");
    });
}

/// A control handle bound to a Pd receive name
#[derive(Debug, Clone, PartialEq)]
pub struct PdReceiver {
    pub handle: ControlHandle,
    /// Receive name, `$0` is expanded after the patch is opened
    pub name: String,
    /// Value sent right after the patch is opened
    pub initial: f32,
}

struct PdState {
    pd: Pd,
    ctx: PdAudioContext,
    /// `$0` of the open patch
    dollar_zero: Option<i32>,
    audio_active: bool,
    /// Resolved receive names by handle
    receivers: BTreeMap<ControlHandle, String>,
    inputs: Vec<Vec<Sample>>,
    outputs: Vec<Vec<Sample>>,
    interleaved_in: Vec<f32>,
    interleaved_out: Vec<f32>,
}

impl PdState {
    fn send_float(&self, receiver: &str, value: f32) -> EngineResult<()> {
        self.pd.set_as_current();
        libpd_rs::functions::send::send_float_to(receiver, value).map_err(|e| {
            EngineError::Backend(format!("send float to '{}' failed: {}", receiver, e))
        })
    }
}

/// Processing engine backed by a libpd instance
pub struct PdEngine {
    layout: EngineLayout,
    bindings: Vec<PdReceiver>,
    state: Mutex<PdState>,
    params: ParameterTable,
}

// PdEngine is Send + Sync because:
// - all libpd calls go through the state mutex
// - set_as_current() is called before every call that touches the instance
// - the remaining fields are owned data
unsafe impl Send for PdEngine {}
unsafe impl Sync for PdEngine {}

impl PdEngine {
    /// Create a libpd instance for `layout` with the given receive bindings
    pub fn new(layout: EngineLayout, bindings: Vec<PdReceiver>) -> EngineResult<Self> {
        if layout.block_size == 0 || layout.block_size % PD_TICK_FRAMES != 0 {
            return Err(EngineError::InitializationFailed(format!(
                "block size {} is not a multiple of {}",
                layout.block_size, PD_TICK_FRAMES
            )));
        }

        init_print_hook();

        let pd = Pd::init_and_configure(
            layout.input_channels as i32,
            layout.output_channels as i32,
            layout.sample_rate as i32,
        )
        .map_err(|e| EngineError::InitializationFailed(format!("libpd init failed: {}", e)))?;
        let ctx = pd.audio_context();

        log::info!("PdEngine created: {}", layout);

        Ok(Self {
            layout,
            bindings,
            state: Mutex::new(PdState {
                pd,
                ctx,
                dollar_zero: None,
                audio_active: false,
                receivers: BTreeMap::new(),
                inputs: vec![vec![0; layout.block_size]; layout.input_channels],
                outputs: vec![vec![0; layout.block_size]; layout.output_channels],
                interleaved_in: vec![0.0; layout.block_size * layout.input_channels],
                interleaved_out: vec![0.0; layout.block_size * layout.output_channels],
            }),
            params: ParameterTable::new(),
        })
    }

    /// Add a search path for externals and abstractions
    pub fn add_search_path(&self, path: &Path) -> EngineResult<()> {
        let mut state = self.lock()?;
        state.pd.add_path_to_search_paths(path).map_err(|e| {
            EngineError::Backend(format!("failed to add search path: {}", e))
        })?;
        log::debug!("PdEngine: added search path {}", path.display());
        Ok(())
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, PdState>> {
        self.state.lock().map_err(|_| EngineError::Poisoned)
    }

    fn resolve(name: &str, dollar_zero: i32) -> String {
        match name.strip_prefix("$0") {
            Some(rest) => format!("{}{}", dollar_zero, rest),
            None => name.to_string(),
        }
    }
}

impl ProcessingEngine for PdEngine {
    fn name(&self) -> &str {
        "pd"
    }

    fn layout(&self) -> EngineLayout {
        self.layout
    }

    fn load_graph(&self, path: &Path) -> EngineResult<()> {
        if !path.exists() {
            return Err(EngineError::GraphNotFound(path.to_path_buf()));
        }

        let mut state = self.lock()?;
        state.pd.set_as_current();

        if state.dollar_zero.take().is_some() {
            if let Err(e) = state.pd.close_patch() {
                log::warn!("PdEngine: failed to close previous patch: {}", e);
            }
        }

        state.pd.open_patch(path).map_err(|e| EngineError::GraphParse {
            path: path.to_path_buf(),
            offset: 0,
            reason: e.to_string(),
        })?;
        let dollar_zero = state.pd.dollar_zero().map_err(|e| EngineError::GraphRejected {
            path: path.to_path_buf(),
            entry: 0,
            reason: format!("failed to get $0: {}", e),
        })?;

        if !state.audio_active {
            state.pd.activate_audio(true).map_err(|e| {
                EngineError::InitializationFailed(format!("failed to activate audio: {}", e))
            })?;
            state.audio_active = true;
        }

        state.receivers = self
            .bindings
            .iter()
            .map(|b| (b.handle, Self::resolve(&b.name, dollar_zero)))
            .collect();
        self.params
            .reset(self.bindings.iter().map(|b| (b.handle, vec![b.initial])))?;
        for binding in &self.bindings {
            if let Some(receiver) = state.receivers.get(&binding.handle) {
                state.send_float(receiver, binding.initial)?;
            }
        }
        state.dollar_zero = Some(dollar_zero);

        log::info!(
            "PdEngine: opened {} ($0={}, {} receivers)",
            path.display(),
            dollar_zero,
            state.receivers.len()
        );
        Ok(())
    }

    fn is_graph_loaded(&self) -> bool {
        self.lock().map(|s| s.dollar_zero.is_some()).unwrap_or(false)
    }

    fn import_block(&self, channel: usize, samples: &[Sample]) -> EngineResult<()> {
        check_channel(channel, self.layout.input_channels)?;
        check_block(&self.layout, samples.len())?;

        let mut state = self.lock()?;
        if state.dollar_zero.is_none() {
            return Err(EngineError::NoGraphLoaded);
        }
        state.inputs[channel].copy_from_slice(samples);
        Ok(())
    }

    fn pump(&self) -> EngineResult<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if state.dollar_zero.is_none() {
            return Err(EngineError::NoGraphLoaded);
        }
        if !state.audio_active {
            return Err(EngineError::NotInitialized);
        }

        let inputs = self.layout.input_channels;
        for (channel, block) in state.inputs.iter().enumerate() {
            for (frame, &s) in block.iter().enumerate() {
                state.interleaved_in[frame * inputs + channel] = sample_to_f32(s);
            }
        }

        let outputs = self.layout.output_channels;
        let ticks =
            libpd_rs::functions::util::calculate_ticks(outputs as i32, state.interleaved_out.len() as i32);
        state.pd.set_as_current();
        state
            .ctx
            .process_float(ticks, &state.interleaved_in, &mut state.interleaved_out);

        for (channel, block) in state.outputs.iter_mut().enumerate() {
            for (frame, dst) in block.iter_mut().enumerate() {
                *dst = f32_to_sample(state.interleaved_out[frame * outputs + channel]);
            }
        }
        Ok(())
    }

    fn export_block(&self, channel: usize, dest: &mut [Sample]) -> EngineResult<()> {
        check_channel(channel, self.layout.output_channels)?;
        check_block(&self.layout, dest.len())?;

        let state = self.lock()?;
        if state.dollar_zero.is_none() {
            return Err(EngineError::NoGraphLoaded);
        }
        dest.copy_from_slice(&state.outputs[channel]);
        Ok(())
    }

    fn set_parameter(
        &self,
        handle: ControlHandle,
        values: &[f32],
        offset: usize,
    ) -> EngineResult<()> {
        let state = self.lock()?;
        if state.dollar_zero.is_none() {
            return Err(EngineError::NoGraphLoaded);
        }
        let receiver = state
            .receivers
            .get(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;

        self.params.set(handle, values, offset)?;
        state.send_float(receiver, values[0])
    }

    fn get_parameter(
        &self,
        handle: ControlHandle,
        dest: &mut [f32],
        offset: usize,
    ) -> EngineResult<()> {
        if !self.is_graph_loaded() {
            return Err(EngineError::NoGraphLoaded);
        }
        self.params.get(handle, dest, offset)
    }
}

impl Drop for PdEngine {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if state.audio_active {
                state.pd.set_as_current();
                if let Err(e) = state.pd.activate_audio(false) {
                    log::warn!("PdEngine: failed to stop audio: {}", e);
                }
            }
        }
        log::debug!("PdEngine dropped");
    }
}
