//! TCP control server
//!
//! States: Listening -> Connected -> Processing(line) -> Closed -> Listening.
//! Sessions run on the server thread one after another; a socket error ends
//! only the current session.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use super::{parse_line, ControlCommand, ControlError, ControlResult, Reply, TunableRegistry};
use crate::engine::ProcessingEngine;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client sent `exit`
    Exit,
    /// Client closed the connection
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub lines: u64,
    pub end: SessionEnd,
}

/// One bounded line read from the client
enum Line {
    Text(String),
    /// Longer than the line limit; the rest of it was discarded
    Overlong,
    /// Not valid UTF-8
    Garbled,
}

/// Read one line of at most `max_len` bytes, not counting the `\n`
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> std::io::Result<Option<Line>> {
    buf.clear();
    let limit = max_len.saturating_add(1);
    let n = reader.by_ref().take(limit as u64).read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(None);
    }

    let terminated = buf.last() == Some(&b'\n');
    if !terminated && n == limit {
        let mut skipped = Vec::new();
        loop {
            skipped.clear();
            let m = reader.by_ref().take(1024).read_until(b'\n', &mut skipped)?;
            if m == 0 || skipped.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(Some(Line::Overlong));
    }

    Ok(Some(match std::str::from_utf8(buf) {
        Ok(text) => Line::Text(text.to_string()),
        Err(_) => Line::Garbled,
    }))
}

/// Serve one control session until `exit` or disconnect
///
/// A final line without a terminator is still processed before the
/// session closes.
pub fn handle_session<R, W>(
    mut reader: R,
    mut writer: W,
    registry: &TunableRegistry,
    engine: &dyn ProcessingEngine,
    max_line_len: usize,
) -> ControlResult<SessionSummary>
where
    R: BufRead,
    W: Write,
{
    let mut buf = Vec::with_capacity(max_line_len.saturating_add(1));
    let mut lines = 0u64;

    while let Some(line) = read_line(&mut reader, &mut buf, max_line_len)? {
        lines += 1;
        let reply = match line {
            Line::Text(text) => {
                log::debug!("Control: received {:?}", text.trim_end());
                match parse_line(&text) {
                    ControlCommand::Exit => {
                        return Ok(SessionSummary {
                            lines,
                            end: SessionEnd::Exit,
                        })
                    }
                    ControlCommand::Set { object_id, value } => {
                        registry.apply(engine, object_id, value)
                    }
                    ControlCommand::MalformedSet => Reply::InvalidFormat,
                    ControlCommand::Unknown => Reply::UnknownCommand,
                }
            }
            Line::Overlong => {
                log::debug!("Control: dropped line longer than {} bytes", max_line_len);
                Reply::UnknownCommand
            }
            Line::Garbled => Reply::UnknownCommand,
        };

        writer.write_all(reply.as_str().as_bytes())?;
        writer.flush()?;
    }

    Ok(SessionSummary {
        lines,
        end: SessionEnd::Disconnected,
    })
}

/// Control channel listener bound to a TCP port
pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<TunableRegistry>,
    engine: Arc<dyn ProcessingEngine>,
    max_line_len: usize,
    stop: Arc<AtomicBool>,
    /// Socket of the session being served, if any
    session: Arc<Mutex<Option<TcpStream>>>,
}

/// Socket slot access that survives a panicked holder
fn session_slot(slot: &Mutex<Option<TcpStream>>) -> MutexGuard<'_, Option<TcpStream>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stops a running [`ControlServer`] from another thread
#[derive(Debug, Clone)]
pub struct ControlShutdown {
    stop: Arc<AtomicBool>,
    addr: SocketAddr,
    session: Arc<Mutex<Option<TcpStream>>>,
}

impl ControlShutdown {
    /// Stop the server, closing a connected session
    pub fn trigger(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(stream) = session_slot(&self.session).take() {
            // Unblocks the session's pending read
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::debug!("Control: closing session socket failed: {}", e);
            }
        }
        // Wake a blocking accept()
        let mut addr = self.addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        if let Err(e) = TcpStream::connect(addr) {
            log::debug!("Control: wake-up connect to {} failed: {}", addr, e);
        }
    }
}

impl ControlServer {
    pub fn bind<A: ToSocketAddrs + std::fmt::Display>(
        addr: A,
        registry: Arc<TunableRegistry>,
        engine: Arc<dyn ProcessingEngine>,
        max_line_len: usize,
    ) -> ControlResult<Self> {
        let listener = TcpListener::bind(&addr).map_err(|error| ControlError::Bind {
            addr: addr.to_string(),
            error,
        })?;
        log::info!(
            "Control channel listening on {} ({} tunables)",
            listener.local_addr()?,
            registry.len()
        );

        Ok(Self {
            listener,
            registry,
            engine,
            max_line_len: max_line_len.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            session: Arc::new(Mutex::new(None)),
        })
    }

    pub fn local_addr(&self) -> ControlResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ControlResult<ControlShutdown> {
        Ok(ControlShutdown {
            stop: self.stop.clone(),
            addr: self.local_addr()?,
            session: self.session.clone(),
        })
    }

    fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) -> ControlResult<SessionSummary> {
        {
            let mut slot = session_slot(&self.session);
            // A trigger that ran before this point found no session to close
            if self.stop.load(Ordering::SeqCst) {
                return Ok(SessionSummary {
                    lines: 0,
                    end: SessionEnd::Disconnected,
                });
            }
            *slot = Some(stream.try_clone()?);
        }

        let reader = BufReader::new(stream.try_clone()?);
        let result = handle_session(
            reader,
            stream,
            &self.registry,
            self.engine.as_ref(),
            self.max_line_len,
        )
        .inspect(|summary| {
            log::info!(
                "Control: {} closed ({:?}, {} lines)",
                peer,
                summary.end,
                summary.lines
            )
        });

        session_slot(&self.session).take();
        result
    }

    /// Accept and serve one connection
    pub fn serve_one(&self) -> ControlResult<SessionSummary> {
        let (stream, peer) = self.listener.accept()?;
        log::info!("Control: {} connected", peer);
        self.serve_connection(stream, peer)
    }

    /// Serve connections one after another until shut down
    pub fn serve(&self) -> ControlResult<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                log::info!("Control channel stopped");
                return Ok(());
            }
            let accepted = self.listener.accept();
            if self.stop.load(Ordering::SeqCst) {
                log::info!("Control channel stopped");
                return Ok(());
            }

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Control: accept failed: {}", e);
                    continue;
                }
            };
            log::info!("Control: {} connected", peer);

            if let Err(e) = self.serve_connection(stream, peer) {
                log::warn!("Control: session with {} ended: {}", peer, e);
            }
        }
    }
}

/// Run a control server on the `control-server` thread
pub fn spawn_control_server(server: ControlServer) -> ControlResult<JoinHandle<ControlResult<()>>> {
    let handle = thread::Builder::new()
        .name("control-server".to_string())
        .spawn(move || server.serve())?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ControlHandle, EngineLayout, MixdownEngine};
    use std::io::Cursor;

    fn engine() -> MixdownEngine {
        MixdownEngine::with_fold_graph(EngineLayout::default()).unwrap()
    }

    fn run(input: &[u8], max_line_len: usize) -> (String, SessionSummary) {
        let engine = engine();
        let registry = TunableRegistry::default();
        let mut out = Vec::new();
        let summary =
            handle_session(Cursor::new(input.to_vec()), &mut out, &registry, &engine, max_line_len)
                .unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn test_session_replies() {
        let (out, summary) = run(
            b"set 30001 0\nset 30001 100\nset 99999 0\nset 30001 abc\nbanana\n",
            64,
        );
        assert_eq!(
            out,
            "OK\nInvalid value\nInvalid object\nInvalid format\nUnknown command\n"
        );
        assert_eq!(summary.end, SessionEnd::Disconnected);
        assert_eq!(summary.lines, 5);
    }

    #[test]
    fn test_exit_stops_without_reply() {
        let (out, summary) = run(b"set 30002 1\r\nexit\r\nset 30002 0\n", 64);
        assert_eq!(out, "OK\n");
        assert_eq!(summary.end, SessionEnd::Exit);
    }

    #[test]
    fn test_final_line_without_newline() {
        let (out, _) = run(b"set 30001 -3", 64);
        assert_eq!(out, "OK\n");
    }

    #[test]
    fn test_overlong_and_garbled_lines() {
        let mut input = vec![b'x'; 100];
        input.push(b'\n');
        input.extend_from_slice(&[0xFF, 0xFE, b'\n']);
        input.extend_from_slice(b"set 30001 1\n");

        let (out, summary) = run(&input, 16);
        assert_eq!(out, "Unknown command\nUnknown command\nOK\n");
        assert_eq!(summary.lines, 3);
    }

    #[test]
    fn test_line_limit_excludes_terminator() {
        let mut at_limit = format!("{:<64}", "set 30001 0").into_bytes();
        assert_eq!(at_limit.len(), 64);
        at_limit.push(b'\n');
        let (out, _) = run(&at_limit, 64);
        assert_eq!(out, "OK\n");

        let mut over = format!("{:<65}", "set 30001 0").into_bytes();
        over.push(b'\n');
        over.extend_from_slice(b"set 30001 1\n");
        let (out, summary) = run(&over, 64);
        assert_eq!(out, "Unknown command\nOK\n");
        assert_eq!(summary.lines, 2);
    }

    #[test]
    fn test_tcp_round_trip() {
        let engine: Arc<MixdownEngine> = Arc::new(engine());
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
        client.write_all(b"set 30001 6\nexit\n").unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "OK\n");

        assert_eq!(session.join().unwrap().end, SessionEnd::Exit);
        let mut gain = [0.0];
        engine.get_parameter(ControlHandle(0x0753_1008), &mut gain, 0).unwrap();
        assert_eq!(gain, [6.0]);
    }

    #[test]
    fn test_shutdown_closes_idle_session() {
        let server = ControlServer::bind(
            "127.0.0.1:0",
            Arc::new(TunableRegistry::default()),
            Arc::new(engine()),
            64,
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle().unwrap();
        let server_thread = spawn_control_server(server).unwrap();

        // One answered command proves the session is being served
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"set 30002 0\n").unwrap();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"OK\n");

        shutdown.trigger();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !server_thread.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(server_thread.is_finished(), "server still blocked on an idle client");
        server_thread.join().unwrap().unwrap();

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);
    }
}
