//! End-to-end runs: sources, store, pump, engine and sinks on real threads

use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use blockpump_core::control::{ControlServer, SessionEnd, TunableRegistry};
use blockpump_core::engine::{
    EngineLayout, MixdownEngine, ProcessingEngine, DEFAULT_GAIN_HANDLE, DEFAULT_MUTE_HANDLE,
};
use blockpump_core::output::{DeviceError, DeviceResult, FileSink, OutputDevice};
use blockpump_core::pump::{ChannelListener, LogListener, PipelineEvent, StopReason};
use blockpump_core::store::EndOfSourcePolicy;
use blockpump_core::{Pipeline, Sample, SourceBinding};

const BLOCK: usize = 4;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn layout() -> EngineLayout {
    EngineLayout {
        block_size: BLOCK,
        ..EngineLayout::default()
    }
}

fn unity_engine() -> Arc<MixdownEngine> {
    let engine = MixdownEngine::with_fold_graph(layout()).unwrap();
    engine.set_parameter(DEFAULT_GAIN_HANDLE, &[0.0], 0).unwrap();
    Arc::new(engine)
}

fn two_sources() -> Vec<SourceBinding> {
    vec![SourceBinding::sequential(0), SourceBinding::sequential(1)]
}

fn encode(frames: &[(Sample, Sample)]) -> Vec<u8> {
    frames
        .iter()
        .flat_map(|&(l, r)| l.to_le_bytes().into_iter().chain(r.to_le_bytes()))
        .collect()
}

fn decode(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks_exact(4)
        .map(|b| Sample::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Writer whose bytes stay readable after the sink moved into the pump
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn samples(&self) -> Vec<Sample> {
        decode(&self.0.lock().unwrap())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_files_are_mixed_block_aligned() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.pcm");
    let second = dir.path().join("second.pcm");

    let frames: Vec<_> = (0..8).map(|f| (100 + f, 200 + f)).collect();
    std::fs::write(&first, encode(&frames)).unwrap();
    std::fs::write(&second, encode(&[(1, 2); 8])).unwrap();

    let engine = unity_engine();
    let pipeline = Pipeline::new(
        BLOCK,
        two_sources(),
        EndOfSourcePolicy::Silence,
        engine.clone(),
        Arc::new(LogListener),
    )
    .unwrap();

    let out = SharedBuf::default();
    let sink = FileSink::new("shared".to_string(), out.clone(), 2);
    let report = pipeline
        .start_files(&[first, second], sink)
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(report.pump.reason, StopReason::SourcesExhausted);
    assert_eq!(report.pump.blocks_written, 2);
    assert_eq!(engine.pump_count(), 2);

    // Fold graph: out0 = in0 + in2, out1 = in1 + in3
    let expected: Vec<Sample> = (0..8).flat_map(|f| [101 + f, 202 + f]).collect();
    assert_eq!(out.samples(), expected);
}

#[test]
fn test_short_source_contributes_silence() {
    init_logging();
    let engine = unity_engine();
    let pipeline = Pipeline::new(
        BLOCK,
        two_sources(),
        EndOfSourcePolicy::Silence,
        engine,
        Arc::new(LogListener),
    )
    .unwrap();

    let sources = vec![
        Cursor::new(encode(&[(10, 20); 8])),
        Cursor::new(encode(&[(1, 2); 4])),
    ];
    let out = SharedBuf::default();
    let report = pipeline
        .start(sources, FileSink::new("shared".to_string(), out.clone(), 2))
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(report.pump.blocks_written, 2);
    let samples = out.samples();
    assert_eq!(&samples[..8], &[11, 22, 11, 22, 11, 22, 11, 22]);
    assert_eq!(&samples[8..], &[10, 20, 10, 20, 10, 20, 10, 20]);
}

/// Device whose writes and recoveries always fail
struct DeadDevice {
    writes: Arc<AtomicUsize>,
    recoveries: Arc<AtomicUsize>,
}

impl OutputDevice for DeadDevice {
    fn name(&self) -> String {
        "dead".to_string()
    }

    fn channels(&self) -> usize {
        2
    }

    fn write_interleaved(&mut self, _samples: &[Sample]) -> DeviceResult<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(DeviceError::Underrun)
    }

    fn recover(&mut self, _error: &DeviceError) -> DeviceResult<()> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Err(DeviceError::Unrecoverable("unplugged".to_string()))
    }
}

#[test]
fn test_failed_recovery_stops_pipeline_once() {
    init_logging();
    let (listener, events) = ChannelListener::new();
    let pipeline = Pipeline::new(
        BLOCK,
        two_sources(),
        EndOfSourcePolicy::Halt,
        unity_engine(),
        Arc::new(listener),
    )
    .unwrap();

    let writes = Arc::new(AtomicUsize::new(0));
    let recoveries = Arc::new(AtomicUsize::new(0));
    let device = DeadDevice {
        writes: writes.clone(),
        recoveries: recoveries.clone(),
    };

    // Plenty of data: readers are still blocked when the pump gives up
    let sources = vec![
        Cursor::new(encode(&[(1, 1); 64])),
        Cursor::new(encode(&[(2, 2); 64])),
    ];
    let report = pipeline.start(sources, device).unwrap().join().unwrap();

    assert_eq!(report.pump.reason, StopReason::DeviceFailed);
    assert_eq!(report.pump.cycles, 1);
    assert_eq!(report.pump.blocks_written, 0);
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);

    let received: Vec<_> = events.try_iter().collect();
    let stops: Vec<_> = received
        .iter()
        .filter(|e| matches!(e, PipelineEvent::AudioStopped(_)))
        .collect();
    assert_eq!(stops, vec![&PipelineEvent::AudioStopped(StopReason::DeviceFailed)]);
    let xruns = received
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Xrun(x) if !x.recovered))
        .count();
    assert_eq!(xruns, 1);
}

#[test]
fn test_control_port_mutes_output() {
    init_logging();
    let engine = unity_engine();
    let server = ControlServer::bind(
        "127.0.0.1:0",
        Arc::new(TunableRegistry::default()),
        engine.clone(),
        64,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let session = thread::spawn(move || server.serve_one().unwrap());

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            b"set 30001 0\nset 30001 25\nset 30003 1\nset 30001\nhello\nset 30002 1\nset 30002 1\nexit\n",
        )
        .unwrap();
    let mut reply = String::new();
    client.read_to_string(&mut reply).unwrap();
    assert_eq!(
        reply,
        "OK\nInvalid value\nInvalid object\nInvalid format\nUnknown command\nOK\nOK\n"
    );
    let summary = session.join().unwrap();
    assert_eq!(summary.end, SessionEnd::Exit);
    assert_eq!(summary.lines, 8);

    let mut muted = [0.0];
    engine
        .get_parameter(DEFAULT_MUTE_HANDLE, &mut muted, 0)
        .unwrap();
    assert_eq!(muted, [1.0]);

    let pipeline = Pipeline::new(
        BLOCK,
        two_sources(),
        EndOfSourcePolicy::Silence,
        engine,
        Arc::new(LogListener),
    )
    .unwrap();
    let sources = vec![
        Cursor::new(encode(&[(500, 600); 4])),
        Cursor::new(encode(&[(7, 8); 4])),
    ];
    let out = SharedBuf::default();
    pipeline
        .start(sources, FileSink::new("shared".to_string(), out.clone(), 2))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out.samples(), vec![0; 8]);
}
