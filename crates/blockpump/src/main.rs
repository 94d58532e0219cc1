//! blockpump - real-time PCM pipeline daemon
//!
//! Reads raw stereo sources, pumps aligned blocks through the processing
//! engine and plays the result, while a TCP control port accepts live
//! parameter changes.

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam::channel::Receiver;

use blockpump_core::config::{EngineBackend, OutputBackend, PipelineConfig};
use blockpump_core::control::{spawn_control_server, ControlServer, TunableRegistry};
use blockpump_core::engine::{MixdownEngine, ProcessingEngine};
use blockpump_core::output::{FileSink, OutputDevice};
use blockpump_core::pump::{
    ChannelListener, ListenerSet, LogListener, PipelineEvent, PipelineListener, StopReason,
};
use blockpump_core::Pipeline;

use cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger - set RUST_LOG=debug for every control line
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if cli.list_devices {
        return list_devices();
    }

    log::info!("blockpump {} starting up", env!("CARGO_PKG_VERSION"));

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let engine = build_engine(&config)?;

    let (events_listener, events) = ChannelListener::new();
    let listener: Arc<dyn PipelineListener> = Arc::new(
        ListenerSet::new()
            .with(Arc::new(LogListener))
            .with(Arc::new(events_listener)),
    );

    let control = if config.control.enabled {
        let registry = Arc::new(TunableRegistry::new(config.tunables.clone())?);
        let server = ControlServer::bind(
            config.control.address(),
            registry,
            engine.clone(),
            config.control.max_line_len,
        )?;
        let shutdown = server.shutdown_handle()?;
        Some((shutdown, spawn_control_server(server)?))
    } else {
        log::info!("Control channel disabled");
        None
    };

    let paths: Vec<_> = config.sources.iter().map(|s| s.path.clone()).collect();
    let pipeline = Pipeline::from_config(&config, engine, listener)?;

    let reason = match config.output.backend {
        OutputBackend::File => {
            let device = open_file_sink(&config)?;
            let handle = pipeline.start_files(&paths, device)?;
            let reason = wait_for_stop(&events);
            handle.join()?;
            reason
        }
        OutputBackend::Cpal => run_cpal(&config, pipeline, &paths, &events)?,
    };

    if let Some((shutdown, thread)) = control {
        shutdown.trigger();
        match thread.join() {
            Ok(Err(e)) => log::warn!("Control channel error: {}", e),
            Err(_) => log::error!("Control thread panicked"),
            Ok(Ok(())) => {}
        }
    }

    match reason {
        StopReason::DeviceFailed => bail!("Output device failed"),
        StopReason::StoreFailed => bail!("Pipeline failed"),
        StopReason::Shutdown | StopReason::SourcesExhausted => {
            log::info!("blockpump finished: {}", reason);
            Ok(())
        }
    }
}

/// Create the configured engine and load its graph
fn build_engine(config: &PipelineConfig) -> Result<Arc<dyn ProcessingEngine>> {
    let layout = config.layout();
    let graph = config.engine.graph.as_deref();

    let engine: Arc<dyn ProcessingEngine> = match config.engine.backend {
        EngineBackend::Mixdown => match graph {
            Some(_) => Arc::new(MixdownEngine::new(layout)),
            None => {
                log::info!("No graph given, folding inputs onto outputs");
                Arc::new(MixdownEngine::with_fold_graph(layout)?)
            }
        },
        EngineBackend::Pd => build_pd_engine(config)?,
    };

    if let Some(path) = graph {
        engine
            .load_graph(path)
            .with_context(|| format!("Failed to load graph {:?}", path))?;
    }
    Ok(engine)
}

#[cfg(feature = "pd-engine")]
fn build_pd_engine(config: &PipelineConfig) -> Result<Arc<dyn ProcessingEngine>> {
    use blockpump_core::control::TunableKind;
    use blockpump_core::engine::{PdEngine, PdReceiver};

    if config.engine.graph.is_none() {
        bail!("The pd engine needs a patch (--graph)");
    }

    let receivers = config
        .tunables
        .iter()
        .filter_map(|t| {
            let name = t.receiver.clone()?;
            let initial = match t.kind {
                TunableKind::Float { min, max } => 0.0f32.clamp(min, max),
                TunableKind::Toggle => 0.0,
            };
            Some(PdReceiver {
                handle: t.handle,
                name,
                initial,
            })
        })
        .collect();

    let engine = PdEngine::new(config.layout(), receivers)?;
    for path in &config.engine.search_paths {
        engine.add_search_path(path)?;
    }
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "pd-engine"))]
fn build_pd_engine(_config: &PipelineConfig) -> Result<Arc<dyn ProcessingEngine>> {
    bail!("blockpump was built without the pd-engine feature")
}

fn open_file_sink(config: &PipelineConfig) -> Result<Box<dyn OutputDevice>> {
    let channels = config.engine.output_channels;
    let path = config.output.file.as_deref().unwrap_or(Path::new("-"));
    if path == Path::new("-") {
        return Ok(Box::new(FileSink::stdout(channels)));
    }
    let sink = FileSink::create(path, channels)
        .with_context(|| format!("Failed to open output file {:?}", path))?;
    Ok(Box::new(sink))
}

#[cfg(feature = "cpal-output")]
fn run_cpal(
    config: &PipelineConfig,
    pipeline: Pipeline,
    paths: &[std::path::PathBuf],
    events: &Receiver<PipelineEvent>,
) -> Result<StopReason> {
    use blockpump_core::output::open_cpal_output;

    let layout = config.layout();
    // The stream handle stays on this thread; the writer goes to the pump
    let (stream, writer) = open_cpal_output(
        config.output.device.as_ref(),
        layout.output_channels,
        layout.sample_rate,
        layout.block_size,
        config.output.latency_ms,
    )?;

    let handle = pipeline.start_files(paths, writer)?;
    let reason = wait_for_stop(events);
    handle.join()?;
    log::info!("{}: {} underruns", stream.device_name(), stream.underrun_count());
    Ok(reason)
}

#[cfg(not(feature = "cpal-output"))]
fn run_cpal(
    _config: &PipelineConfig,
    _pipeline: Pipeline,
    _paths: &[std::path::PathBuf],
    _events: &Receiver<PipelineEvent>,
) -> Result<StopReason> {
    bail!("blockpump was built without the cpal-output feature; use --output file")
}

#[cfg(feature = "cpal-output")]
fn list_devices() -> Result<()> {
    for device in blockpump_core::output::list_output_devices() {
        println!("{}", device);
    }
    Ok(())
}

#[cfg(not(feature = "cpal-output"))]
fn list_devices() -> Result<()> {
    bail!("blockpump was built without the cpal-output feature")
}

/// Block until the pump coordinator reports that it stopped
fn wait_for_stop(events: &Receiver<PipelineEvent>) -> StopReason {
    loop {
        match events.recv() {
            Ok(PipelineEvent::AudioStopped(reason)) => return reason,
            Ok(_) => {}
            // All senders gone: the coordinator cannot report anymore
            Err(_) => return StopReason::Shutdown,
        }
    }
}
