//! MixdownEngine - built-in routing and gain graph
//!
//! Sums each input channel into its routed output channel, then applies a
//! master gain in dB and a mute switch. The graph definition is a small YAML
//! document:
//!
//! ```yaml
//! routes:
//!   - { input: 0, output: 0 }
//!   - { input: 1, output: 1 }
//!   - { input: 2, output: 0 }
//!   - { input: 3, output: 1 }
//! gain_handle: 122884104   # 0x07531008
//! mute_handle: 122888200   # 0x07532008
//! default_gain_db: -20.0
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::params::ParameterTable;
use super::{
    check_block, check_channel, ControlHandle, EngineError, EngineLayout, EngineResult,
    ProcessingEngine,
};
use crate::types::Sample;

/// Handle of the master gain parameter (dB) in the default graph
pub const DEFAULT_GAIN_HANDLE: ControlHandle = ControlHandle(0x0753_1008);

/// Handle of the mute switch (0/1) in the default graph
pub const DEFAULT_MUTE_HANDLE: ControlHandle = ControlHandle(0x0753_2008);

/// One input-to-output connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub input: usize,
    pub output: usize,
}

/// Graph definition for the mixdown engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixdownGraph {
    pub routes: Vec<Route>,
    #[serde(default = "default_gain_handle")]
    pub gain_handle: ControlHandle,
    #[serde(default = "default_mute_handle")]
    pub mute_handle: ControlHandle,
    /// Master gain applied until the first `set`
    #[serde(default = "default_gain_db")]
    pub default_gain_db: f32,
}

fn default_gain_handle() -> ControlHandle {
    DEFAULT_GAIN_HANDLE
}

fn default_mute_handle() -> ControlHandle {
    DEFAULT_MUTE_HANDLE
}

fn default_gain_db() -> f32 {
    -20.0
}

impl MixdownGraph {
    /// Fold inputs onto outputs round-robin: input `i` feeds output `i % outputs`
    pub fn fold(layout: &EngineLayout) -> Self {
        let outputs = layout.output_channels.max(1);
        Self {
            routes: (0..layout.input_channels)
                .map(|input| Route {
                    input,
                    output: input % outputs,
                })
                .collect(),
            gain_handle: DEFAULT_GAIN_HANDLE,
            mute_handle: DEFAULT_MUTE_HANDLE,
            default_gain_db: default_gain_db(),
        }
    }

    /// Index and description of the first entry this layout cannot run
    fn first_invalid(&self, layout: &EngineLayout) -> Option<(usize, String)> {
        if self.gain_handle == self.mute_handle {
            return Some((0, format!("gain and mute share handle {}", self.gain_handle)));
        }
        if !self.default_gain_db.is_finite() {
            return Some((0, "default_gain_db must be finite".to_string()));
        }
        self.routes.iter().enumerate().find_map(|(i, route)| {
            if route.input >= layout.input_channels {
                Some((i, format!("input {} out of range", route.input)))
            } else if route.output >= layout.output_channels {
                Some((i, format!("output {} out of range", route.output)))
            } else {
                None
            }
        })
    }
}

/// Audio-side state, touched only by the pump coordinator
struct MixdownState {
    graph: Option<MixdownGraph>,
    inputs: Vec<Vec<Sample>>,
    outputs: Vec<Vec<Sample>>,
    /// Wide accumulator for one output channel, reused across pumps
    mix: Vec<i64>,
}

/// In-process routing/gain engine
pub struct MixdownEngine {
    layout: EngineLayout,
    state: Mutex<MixdownState>,
    params: ParameterTable,
    pumps: AtomicU64,
}

impl MixdownEngine {
    /// Create an engine with no graph loaded
    pub fn new(layout: EngineLayout) -> Self {
        log::info!("MixdownEngine created: {}", layout);
        Self {
            layout,
            state: Mutex::new(MixdownState {
                graph: None,
                inputs: vec![vec![0; layout.block_size]; layout.input_channels],
                outputs: vec![vec![0; layout.block_size]; layout.output_channels],
                mix: vec![0; layout.block_size],
            }),
            params: ParameterTable::new(),
            pumps: AtomicU64::new(0),
        }
    }

    /// Create an engine with the round-robin fold graph already loaded
    pub fn with_fold_graph(layout: EngineLayout) -> EngineResult<Self> {
        let engine = Self::new(layout);
        engine.install(MixdownGraph::fold(&layout), Path::new("<fold>"))?;
        Ok(engine)
    }

    /// Number of completed pump cycles
    pub fn pump_count(&self) -> u64 {
        self.pumps.load(Ordering::Relaxed)
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, MixdownState>> {
        self.state.lock().map_err(|_| EngineError::Poisoned)
    }

    /// Validate and activate a parsed graph
    pub fn install(&self, graph: MixdownGraph, origin: &Path) -> EngineResult<()> {
        if let Some((entry, reason)) = graph.first_invalid(&self.layout) {
            return Err(EngineError::GraphRejected {
                path: origin.to_path_buf(),
                entry,
                reason,
            });
        }

        self.params.reset([
            (graph.gain_handle, vec![graph.default_gain_db]),
            (graph.mute_handle, vec![0.0]),
        ])?;

        log::info!(
            "MixdownEngine: graph {} loaded ({} routes, gain {}, mute {})",
            origin.display(),
            graph.routes.len(),
            graph.gain_handle,
            graph.mute_handle
        );
        self.lock()?.graph = Some(graph);
        Ok(())
    }

    /// Current linear output gain including mute
    fn output_gain(&self, graph: &MixdownGraph) -> f64 {
        let muted = self.params.scalar(graph.mute_handle).unwrap_or(0.0) != 0.0;
        if muted {
            return 0.0;
        }
        let gain_db = self
            .params
            .scalar(graph.gain_handle)
            .unwrap_or(graph.default_gain_db);
        10f64.powf(gain_db as f64 / 20.0)
    }
}

impl ProcessingEngine for MixdownEngine {
    fn name(&self) -> &str {
        "mixdown"
    }

    fn layout(&self) -> EngineLayout {
        self.layout
    }

    fn load_graph(&self, path: &Path) -> EngineResult<()> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::GraphNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(EngineError::Io(e)),
        };

        let graph: MixdownGraph =
            serde_yaml::from_str(&text).map_err(|e| EngineError::GraphParse {
                path: path.to_path_buf(),
                offset: e.location().map(|l| l.index()).unwrap_or(0),
                reason: e.to_string(),
            })?;

        self.install(graph, path)
    }

    fn is_graph_loaded(&self) -> bool {
        self.lock().map(|s| s.graph.is_some()).unwrap_or(false)
    }

    fn import_block(&self, channel: usize, samples: &[Sample]) -> EngineResult<()> {
        check_channel(channel, self.layout.input_channels)?;
        check_block(&self.layout, samples.len())?;

        let mut state = self.lock()?;
        if state.graph.is_none() {
            return Err(EngineError::NoGraphLoaded);
        }
        state.inputs[channel].copy_from_slice(samples);
        Ok(())
    }

    fn pump(&self) -> EngineResult<()> {
        let mut guard = self.lock()?;
        let MixdownState {
            graph,
            inputs,
            outputs,
            mix,
        } = &mut *guard;
        let graph = graph.as_ref().ok_or(EngineError::NoGraphLoaded)?;
        let gain = self.output_gain(graph);

        for (channel, out) in outputs.iter_mut().enumerate() {
            mix.fill(0);
            for route in graph.routes.iter().filter(|r| r.output == channel) {
                for (acc, &s) in mix.iter_mut().zip(&inputs[route.input]) {
                    *acc += s as i64;
                }
            }
            for (dst, &acc) in out.iter_mut().zip(mix.iter()) {
                // `as` saturates float-to-int conversions
                *dst = (acc as f64 * gain) as Sample;
            }
        }

        self.pumps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn export_block(&self, channel: usize, dest: &mut [Sample]) -> EngineResult<()> {
        check_channel(channel, self.layout.output_channels)?;
        check_block(&self.layout, dest.len())?;

        let state = self.lock()?;
        if state.graph.is_none() {
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
        if !self.is_graph_loaded() {
            return Err(EngineError::NoGraphLoaded);
        }
        self.params.set(handle, values, offset)
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
