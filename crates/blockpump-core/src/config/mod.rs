//! Pipeline configuration
//!
//! Loaded from `~/.config/blockpump/config.yaml` with command-line
//! overrides applied on top. Every section has defaults, so an empty or
//! missing file describes the stock 4-in/2-out rack: two stereo sources,
//! 768-frame blocks at 48 kHz, control port 24.
//!
//! ```yaml
//! engine:
//!   backend: mixdown
//!   block_size: 768
//! sources:
//!   - path: /tmp/mic.pcm
//!     channels: [0, 1]
//!   - path: /tmp/line.pcm
//!     channels: [2, 3]
//! output:
//!   backend: cpal
//!   device: { name: "hw:0,0", host: ALSA }
//! control:
//!   port: 24
//! end_of_source: halt
//! ```

mod io;
mod paths;

pub use io::{load_config, read_config, save_config};
pub use paths::{config_dir, default_config_path};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::{default_tunables, Tunable, TunableKind};
use crate::engine::EngineLayout;
use crate::output::DeviceId;
use crate::store::EndOfSourcePolicy;
use crate::types::{
    SourceBinding, DEFAULT_BLOCK_SIZE, DEFAULT_INPUT_CHANNELS, DEFAULT_OUTPUT_CHANNELS,
    DEFAULT_SAMPLE_RATE,
};

/// Default TCP port of the control channel
pub const DEFAULT_CONTROL_PORT: u16 = 24;

/// Longest accepted control line in bytes, terminator excluded
pub const DEFAULT_MAX_LINE_LEN: usize = 64;

/// Default output ring latency for device backends
pub const DEFAULT_LATENCY_MS: u32 = 100;

/// Configuration problems found by [`PipelineConfig::validate`]
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Block size must be greater than zero")]
    ZeroBlockSize,

    #[error("Sample rate must be greater than zero")]
    ZeroSampleRate,

    #[error("At least one output channel is required")]
    NoOutputChannels,

    #[error("No sources configured")]
    NoSources,

    #[error("Source {source_index} binds channel {channel}, but the engine has {channels} inputs")]
    ChannelOutOfRange {
        source_index: usize,
        channel: usize,
        channels: usize,
    },

    #[error("Channel {0} is bound by more than one source")]
    ChannelBoundTwice(usize),

    #[error("Input channel {0} is not fed by any source")]
    ChannelUnbound(usize),

    #[error("Tunable object id {0} is defined twice")]
    DuplicateTunable(i64),

    #[error("Tunable {object_id} has min {min} greater than max {max}")]
    InvalidTunableRange { object_id: i64, min: f32, max: f32 },

    #[error("Control line length must be greater than zero")]
    ZeroLineLength,

    #[error("Output backend 'file' needs a file path")]
    MissingOutputFile,
}

/// Which processing engine runs the graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineBackend {
    /// Built-in routing/gain graph (YAML graph file)
    #[default]
    Mixdown,
    /// Pure Data patch via libpd
    Pd,
}

impl std::str::FromStr for EngineBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mixdown" => Ok(Self::Mixdown),
            "pd" => Ok(Self::Pd),
            other => Err(format!("unknown engine '{}' (expected mixdown or pd)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: EngineBackend,
    pub sample_rate: u32,
    /// Frames per channel in one pump cycle
    pub block_size: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Graph definition; the command line usually provides this
    pub graph: Option<PathBuf>,
    /// Extra search paths for Pd abstractions
    pub search_paths: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            input_channels: DEFAULT_INPUT_CHANNELS,
            output_channels: DEFAULT_OUTPUT_CHANNELS,
            graph: None,
            search_paths: Vec::new(),
        }
    }
}

/// One raw PCM source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// `[left, right]` engine input channels; sequential pairs when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<[usize; 2]>,
}

impl SourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            channels: None,
        }
    }

    /// Binding for this source at position `index`
    pub fn binding(&self, index: usize) -> SourceBinding {
        match self.channels {
            Some([left, right]) => SourceBinding::new(left, right),
            None => SourceBinding::sequential(index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputBackend {
    /// System audio device via cpal
    Cpal,
    /// Raw S32_LE to a file or stdout
    File,
}

impl Default for OutputBackend {
    fn default() -> Self {
        if cfg!(feature = "cpal-output") {
            Self::Cpal
        } else {
            Self::File
        }
    }
}

impl std::str::FromStr for OutputBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpal" => Ok(Self::Cpal),
            "file" => Ok(Self::File),
            other => Err(format!("unknown output '{}' (expected cpal or file)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub backend: OutputBackend,
    /// Device to open; the host default when unset
    pub device: Option<DeviceId>,
    /// Target of the file backend, `-` for stdout
    pub file: Option<PathBuf>,
    pub latency_ms: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            backend: OutputBackend::default(),
            device: None,
            file: Some(PathBuf::from("-")),
            latency_ms: DEFAULT_LATENCY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub max_line_len: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_CONTROL_PORT,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl ControlConfig {
    /// `bind:port` for the listening socket
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub engine: EngineConfig,
    pub sources: Vec<SourceConfig>,
    pub output: OutputConfig,
    pub control: ControlConfig,
    pub tunables: Vec<Tunable>,
    pub end_of_source: EndOfSourcePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            sources: Vec::new(),
            output: OutputConfig::default(),
            control: ControlConfig::default(),
            tunables: default_tunables(),
            end_of_source: EndOfSourcePolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Load the config at `path`, or the default location when `None`
    ///
    /// An explicit path must exist and parse; the default location falls
    /// back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => read_config(path),
            None => Ok(load_config(&default_config_path())),
        }
    }

    /// Replace the source list with `paths`, keeping configured channel
    /// maps position by position
    pub fn set_source_paths(&mut self, paths: &[PathBuf]) {
        if paths.is_empty() {
            return;
        }
        self.sources = paths
            .iter()
            .enumerate()
            .map(|(i, path)| SourceConfig {
                path: path.clone(),
                channels: self.sources.get(i).and_then(|s| s.channels),
            })
            .collect();
    }

    pub fn bindings(&self) -> Vec<SourceBinding> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, s)| s.binding(i))
            .collect()
    }

    pub fn layout(&self) -> EngineLayout {
        EngineLayout {
            input_channels: self.engine.input_channels,
            output_channels: self.engine.output_channels,
            block_size: self.engine.block_size,
            sample_rate: self.engine.sample_rate,
        }
    }

    /// Check everything that can be checked without opening files or devices
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.engine.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.engine.output_channels == 0 {
            return Err(ConfigError::NoOutputChannels);
        }
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let channels = self.engine.input_channels;
        let mut bound = BTreeSet::new();
        for (source_index, binding) in self.bindings().iter().enumerate() {
            for channel in binding.channels() {
                if channel >= channels {
                    return Err(ConfigError::ChannelOutOfRange {
                        source_index,
                        channel,
                        channels,
                    });
                }
                if !bound.insert(channel) {
                    return Err(ConfigError::ChannelBoundTwice(channel));
                }
            }
        }
        if let Some(unbound) = (0..channels).find(|c| !bound.contains(c)) {
            return Err(ConfigError::ChannelUnbound(unbound));
        }

        let mut ids = BTreeSet::new();
        for tunable in &self.tunables {
            if !ids.insert(tunable.object_id) {
                return Err(ConfigError::DuplicateTunable(tunable.object_id));
            }
            if let TunableKind::Float { min, max } = tunable.kind {
                if min.is_nan() || max.is_nan() || min > max {
                    return Err(ConfigError::InvalidTunableRange {
                        object_id: tunable.object_id,
                        min,
                        max,
                    });
                }
            }
        }

        if self.control.max_line_len == 0 {
            return Err(ConfigError::ZeroLineLength);
        }
        if self.output.backend == OutputBackend::File && self.output.file.is_none() {
            return Err(ConfigError::MissingOutputFile);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ControlHandle;

    fn two_sources() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.set_source_paths(&[PathBuf::from("a.pcm"), PathBuf::from("b.pcm")]);
        config
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.layout(), EngineLayout::default());
        assert_eq!(config.control.port, 24);
        assert_eq!(config.control.max_line_len, 64);
        assert_eq!(config.end_of_source, EndOfSourcePolicy::Halt);
        assert_eq!(config.tunables.len(), 2);
        assert_eq!(config.validate(), Err(ConfigError::NoSources));
    }

    #[test]
    fn test_sequential_bindings_validate() {
        let config = two_sources();
        assert_eq!(
            config.bindings(),
            vec![SourceBinding::new(0, 1), SourceBinding::new(2, 3)]
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_binding_errors() {
        let mut config = two_sources();
        config.sources[1].channels = Some([1, 2]);
        assert_eq!(config.validate(), Err(ConfigError::ChannelBoundTwice(1)));

        config.sources[1].channels = Some([2, 7]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ChannelOutOfRange {
                source_index: 1,
                channel: 7,
                channels: 4
            })
        );

        let mut config = PipelineConfig::default();
        config.set_source_paths(&[PathBuf::from("only.pcm")]);
        assert_eq!(config.validate(), Err(ConfigError::ChannelUnbound(2)));
    }

    #[test]
    fn test_tunable_errors() {
        let mut config = two_sources();
        config
            .tunables
            .push(Tunable::toggle(30001, "again", ControlHandle(9)));
        assert_eq!(config.validate(), Err(ConfigError::DuplicateTunable(30001)));

        let mut config = two_sources();
        config.tunables = vec![Tunable::float(1, "x", ControlHandle(1), 3.0, 1.0)];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTunableRange { object_id: 1, .. })
        ));
    }

    #[test]
    fn test_source_paths_keep_channel_maps() {
        let mut config = PipelineConfig::default();
        config.sources = vec![
            SourceConfig {
                path: PathBuf::from("old.pcm"),
                channels: Some([2, 3]),
            },
            SourceConfig::new("old2.pcm"),
        ];
        config.set_source_paths(&[PathBuf::from("new.pcm"), PathBuf::from("new2.pcm")]);
        assert_eq!(config.sources[0].channels, Some([2, 3]));
        assert_eq!(config.sources[0].path, PathBuf::from("new.pcm"));
        assert_eq!(config.bindings()[1], SourceBinding::new(2, 3));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
engine:
  block_size: 256
sources:
  - path: /tmp/a.pcm
    channels: [2, 3]
  - path: /tmp/b.pcm
    channels: [0, 1]
output:
  backend: file
  file: /tmp/out.raw
control:
  port: 2424
end_of_source: silence
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.block_size, 256);
        assert_eq!(config.engine.sample_rate, 48000);
        assert_eq!(config.sources[0].binding(0), SourceBinding::new(2, 3));
        assert_eq!(config.output.backend, OutputBackend::File);
        assert_eq!(config.control.port, 2424);
        assert_eq!(config.control.bind, "0.0.0.0");
        assert_eq!(config.end_of_source, EndOfSourcePolicy::Silence);
        assert_eq!(config.tunables, default_tunables());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_load_explicit_path_must_exist() {
        assert!(PipelineConfig::load(Some(Path::new("/nonexistent/config.yaml"))).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        save_config(&two_sources(), &path).unwrap();
        assert_eq!(PipelineConfig::load(Some(&path)).unwrap(), two_sources());
    }
}
