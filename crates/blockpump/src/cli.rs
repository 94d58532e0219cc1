use std::path::PathBuf;

use blockpump_core::config::{EngineBackend, OutputBackend, PipelineConfig};
use blockpump_core::store::EndOfSourcePolicy;
use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "blockpump")]
#[command(version, about = "Pump raw PCM sources through a processing graph to an audio device")]
pub struct Cli {
    /// Raw S32_LE stereo sources, bound in order to channels (0,1), (2,3), ...
    pub sources: Vec<PathBuf>,

    /// Graph definition loaded into the engine (YAML for mixdown, .pd for pd)
    #[arg(long, short)]
    pub graph: Option<PathBuf>,

    /// Config file (default: ~/.config/blockpump/config.yaml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Control channel TCP port
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Disable the control channel
    #[arg(long)]
    pub no_control: bool,

    /// Output backend: cpal or file
    #[arg(long, short)]
    pub output: Option<OutputBackend>,

    /// File for the file backend, `-` for stdout
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Output device name, optionally prefixed with its host (ALSA:hw:0,0)
    #[arg(long)]
    pub device: Option<String>,

    /// Processing engine: mixdown or pd
    #[arg(long, short)]
    pub engine: Option<EngineBackend>,

    /// What a finished source does: halt (stall the pump) or silence
    #[arg(long)]
    pub end_of_source: Option<EndOfSourcePolicy>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

impl Cli {
    /// Apply command-line values on top of the file config
    pub fn apply(&self, config: &mut PipelineConfig) {
        config.set_source_paths(&self.sources);
        if let Some(graph) = &self.graph {
            config.engine.graph = Some(graph.clone());
        }
        if let Some(port) = self.port {
            config.control.port = port;
        }
        if self.no_control {
            config.control.enabled = false;
        }
        if let Some(backend) = self.output {
            config.output.backend = backend;
        }
        if let Some(file) = &self.output_file {
            config.output.backend = OutputBackend::File;
            config.output.file = Some(file.clone());
        }
        if let Some(device) = &self.device {
            config.output.device = Some(blockpump_core::output::DeviceId::parse(device));
        }
        if let Some(engine) = self.engine {
            config.engine.backend = engine;
        }
        if let Some(policy) = self.end_of_source {
            config.end_of_source = policy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "blockpump",
            "--graph",
            "rack.yaml",
            "--port",
            "2424",
            "--output-file",
            "out.raw",
            "--end-of-source",
            "silence",
            "a.pcm",
            "b.pcm",
        ]);
        let mut config = PipelineConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.engine.graph, Some(PathBuf::from("rack.yaml")));
        assert_eq!(config.control.port, 2424);
        assert_eq!(config.output.backend, OutputBackend::File);
        assert_eq!(config.output.file, Some(PathBuf::from("out.raw")));
        assert_eq!(config.end_of_source, EndOfSourcePolicy::Silence);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_engine() {
        assert!(Cli::try_parse_from(["blockpump", "--engine", "vst"]).is_err());
    }
}
