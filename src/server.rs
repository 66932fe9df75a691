use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::common::DEFAULT_PORT;
use crate::error::SessionError;
use crate::protocol::{ControlChannel, ControlMessage, Mode, ReadyInfo, SessionState, TransferResult};

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507;

/// Pause after a failed accept, so a persistent failure such as fd exhaustion does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub file: PathBuf,
    /// Chunk size in bytes, at least 1.
    pub bufsize: usize,
}

impl ServerConfig {
    pub fn new(file: impl Into<PathBuf>, bufsize: usize) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            file: file.into(),
            bufsize,
        }
    }

    pub fn bind_addr(&self) -> String {
        self.host.clone() + ":" + &self.port.to_string()
    }
}

/// State owned by the handler of one control connection.
#[derive(Debug)]
pub struct TransferSession {
    pub mode: Mode,
    pub path: PathBuf,
    pub filesize: u64,
    pub chunk_size: usize,
    /// Client address for datagrams: the control peer's IP with the port from the request.
    pub udp_target: Option<SocketAddr>,
    file: File,
}

impl TransferSession {
    /// Opens and stats the source file. Nothing is sent to the client until this succeeds.
    pub fn open(
        mode: Mode,
        path: &Path,
        bufsize: usize,
        udp_target: Option<SocketAddr>,
    ) -> Result<Self, SessionError> {
        let fs_error = |source: io::Error| SessionError::FileSystem {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(fs_error)?;
        let filesize = file.metadata().map_err(fs_error)?.len();
        let chunk_size = match mode {
            Mode::Tcp => bufsize,
            Mode::Udp => bufsize.min(MAX_DATAGRAM_PAYLOAD),
        };

        Ok(Self {
            mode,
            path: path.to_path_buf(),
            filesize,
            chunk_size: chunk_size.max(1),
            udp_target,
            file,
        })
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn ready_info(&self) -> ReadyInfo {
        ReadyInfo {
            filename: self.filename(),
            filesize: self.filesize,
            bufsize: self.chunk_size,
        }
    }
}

/// Checks a client's first message and resolves where datagrams would go.
pub fn negotiate(request: ControlMessage, peer: SocketAddr) -> Result<(Mode, Option<SocketAddr>), String> {
    match request {
        ControlMessage::ModeRequest { mode: Mode::Tcp, .. } => Ok((Mode::Tcp, None)),
        ControlMessage::ModeRequest {
            mode: Mode::Udp,
            udp_port: Some(0),
        } => Err("UDP mode requires a non-zero udp_port".to_string()),
        ControlMessage::ModeRequest {
            mode: Mode::Udp,
            udp_port: Some(port),
        } => Ok((Mode::Udp, Some(SocketAddr::new(peer.ip(), port)))),
        ControlMessage::ModeRequest {
            mode: Mode::Udp,
            udp_port: None,
        } => Err("UDP mode requires udp_port".to_string()),
        ControlMessage::Ready(_) | ControlMessage::Error { .. } | ControlMessage::Result(_) => {
            Err("expected a mode request".to_string())
        }
    }
}

/// Fills `buf` from `source` unless EOF comes first, so every chunk but the
/// last is exactly `buf.len()` bytes.
fn read_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streams `source` into `sink` chunk by chunk. Only the loop is timed.
pub fn send_tcp<R: Read, W: Write>(
    source: &mut R,
    sink: &mut W,
    chunk_size: usize,
) -> io::Result<TransferResult> {
    let mut buf = vec![0u8; chunk_size];
    let mut bytes_sent = 0u64;

    info!(chunk_size, "starting TCP send");
    let start = Instant::now();
    loop {
        let n = read_chunk(source, &mut buf)?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
        bytes_sent += n as u64;
    }
    sink.flush()?;
    let elapsed = start.elapsed();

    info!(bytes_sent, elapsed = ?elapsed, "TCP send finished");
    Ok(TransferResult {
        protocol: Mode::Tcp,
        bytes_sent,
        elapsed_s: elapsed.as_secs_f64(),
        packets: None,
    })
}

/// Sends one datagram per chunk to `target`. No sequencing, no retries.
pub fn send_udp<R: Read>(
    source: &mut R,
    socket: &UdpSocket,
    target: SocketAddr,
    chunk_size: usize,
) -> io::Result<TransferResult> {
    let mut buf = vec![0u8; chunk_size];
    let mut bytes_sent = 0u64;
    let mut packets = 0u64;

    info!(%target, chunk_size, "starting UDP send");
    let start = Instant::now();
    loop {
        let n = read_chunk(source, &mut buf)?;
        if n == 0 {
            break;
        }
        socket.send_to(&buf[..n], target)?;
        bytes_sent += n as u64;
        packets += 1;
    }
    let elapsed = start.elapsed();

    info!(packets, bytes_sent, elapsed = ?elapsed, "UDP send finished");
    Ok(TransferResult {
        protocol: Mode::Udp,
        bytes_sent,
        elapsed_s: elapsed.as_secs_f64(),
        packets: Some(packets),
    })
}

fn udp_socket_for(target: SocketAddr) -> io::Result<UdpSocket> {
    match target {
        SocketAddr::V4(_) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

fn enter(peer: SocketAddr, state: SessionState) {
    debug!(%peer, ?state, "session state");
}

fn reject(control: &mut ControlChannel, peer: SocketAddr, reason: &str) {
    warn!(%peer, reason, "rejecting session");
    if let Err(e) = control.send(&ControlMessage::Error {
        message: reason.to_string(),
    }) {
        debug!(%peer, error = %e, "could not deliver error response");
    }
}

fn serve_session(control: &mut ControlChannel, peer: SocketAddr, config: &ServerConfig) -> Result<(), SessionError> {
    enter(peer, SessionState::Negotiating);
    let request = match control.recv() {
        Ok(Some(request)) => request,
        Ok(None) => {
            return Err(SessionError::Negotiation(
                "client disconnected before sending a request".to_string(),
            ))
        }
        Err(SessionError::Decode(e)) => {
            reject(control, peer, &e.to_string());
            return Err(SessionError::Decode(e));
        }
        Err(e) => return Err(e),
    };

    let (mode, udp_target) = match negotiate(request, peer) {
        Ok(negotiated) => negotiated,
        Err(reason) => {
            reject(control, peer, &reason);
            return Err(SessionError::Negotiation(reason));
        }
    };
    info!(%peer, %mode, "client requested mode");

    let mut session = match TransferSession::open(mode, &config.file, config.bufsize, udp_target) {
        Ok(session) => session,
        Err(e) => {
            reject(control, peer, "source file unavailable");
            return Err(e);
        }
    };
    control.send(&ControlMessage::Ready(session.ready_info()))?;

    enter(peer, SessionState::Transferring);
    let result = match (session.mode, session.udp_target) {
        (Mode::Tcp, _) => send_tcp(&mut session.file, control, session.chunk_size)?,
        (Mode::Udp, Some(target)) => {
            let socket = udp_socket_for(target)?;
            send_udp(&mut session.file, &socket, target, session.chunk_size)?
        }
        (Mode::Udp, None) => return Err(SessionError::Negotiation("no UDP target".to_string())),
    };

    enter(peer, SessionState::ReportingResult);
    control.send(&ControlMessage::Result(result))?;
    Ok(())
}

/// Runs one session to completion and closes the control connection.
/// Errors are logged here and never reach the accept loop.
pub fn handle_session(stream: TcpStream, config: &ServerConfig) -> SessionState {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            error!(error = %e, "control connection has no peer address");
            return SessionState::ClosedOnError;
        }
    };
    info!(%peer, "control connection accepted");

    let mut control = match ControlChannel::new(stream) {
        Ok(control) => control,
        Err(e) => {
            error!(%peer, error = %e, "could not set up control channel");
            return SessionState::ClosedOnError;
        }
    };

    let state = match serve_session(&mut control, peer, config) {
        Ok(()) => SessionState::Closed,
        Err(e) => {
            error!(%peer, error = %e, "session failed");
            SessionState::ClosedOnError
        }
    };
    control.shutdown();
    info!(%peer, ?state, "control connection closed");
    state
}

fn announce_source(path: &Path) {
    match std::fs::metadata(path) {
        Ok(meta) => info!(file = %path.display(), size = meta.len(), "serving local file"),
        Err(e) => warn!(file = %path.display(), error = %e, "source file not available yet"),
    }
}

/// Blocking server: one control connection at a time, each served to completion.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        announce_source(&config.file);
        let listener = TcpListener::bind(config.bind_addr())?;
        info!(addr = %listener.local_addr()?, "control listener ready");
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn serve_one(&self) -> io::Result<SessionState> {
        let (stream, _peer) = self.listener.accept()?;
        Ok(handle_session(stream, &self.config))
    }

    /// Like [`Server::serve_one`], but a failed accept is logged and yields `None`.
    pub fn serve_next(&self) -> Option<SessionState> {
        match self.serve_one() {
            Ok(state) => Some(state),
            Err(e) => {
                error!(error = %e, "accept failed");
                None
            }
        }
    }

    pub fn run(&self) -> ! {
        loop {
            if self.serve_next().is_none() {
                std::thread::sleep(ACCEPT_RETRY_DELAY);
            }
        }
    }
}

/// Accepts on a tokio listener and gives every session its own blocking task.
/// Sessions share nothing but the configuration.
pub async fn serve_concurrent(listener: tokio::net::TcpListener, config: ServerConfig) -> anyhow::Result<()> {
    announce_source(&config.file);
    info!(addr = %listener.local_addr()?, "control listener ready");
    let config = Arc::new(config);
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "dispatching session");
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        let config = Arc::clone(&config);
        tokio::task::spawn_blocking(move || handle_session(stream, &config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn peer() -> SocketAddr {
        "192.0.2.7:51000".parse().unwrap()
    }

    #[test]
    fn udp_request_needs_a_port() {
        let err = negotiate(
            ControlMessage::ModeRequest {
                mode: Mode::Udp,
                udp_port: None,
            },
            peer(),
        )
        .unwrap_err();
        assert!(err.contains("udp_port"));
    }

    #[test]
    fn udp_port_zero_is_rejected() {
        let err = negotiate(
            ControlMessage::ModeRequest {
                mode: Mode::Udp,
                udp_port: Some(0),
            },
            peer(),
        )
        .unwrap_err();
        assert!(err.contains("non-zero"));
    }

    #[test]
    fn failed_accept_keeps_the_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut config = ServerConfig::new(&path, 4);
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        let server = Server::bind(config).unwrap();

        // Nothing pending: a non-blocking accept fails with WouldBlock.
        server.listener.set_nonblocking(true).unwrap();
        assert_eq!(server.serve_next(), None);

        server.listener.set_nonblocking(false).unwrap();
        let addr = server.local_addr().unwrap();
        let client = std::thread::spawn(move || drop(TcpStream::connect(addr).unwrap()));
        assert_eq!(server.serve_next(), Some(SessionState::ClosedOnError));
        client.join().unwrap();
    }

    #[test]
    fn udp_target_uses_control_peer_ip() {
        let (mode, target) = negotiate(
            ControlMessage::ModeRequest {
                mode: Mode::Udp,
                udp_port: Some(40000),
            },
            peer(),
        )
        .unwrap();
        assert_eq!(mode, Mode::Udp);
        assert_eq!(target, Some("192.0.2.7:40000".parse().unwrap()));
    }

    #[test]
    fn tcp_request_ignores_port() {
        let negotiated = negotiate(
            ControlMessage::ModeRequest {
                mode: Mode::Tcp,
                udp_port: Some(40000),
            },
            peer(),
        );
        assert_eq!(negotiated, Ok((Mode::Tcp, None)));
    }

    #[test]
    fn only_mode_requests_open_a_session() {
        let negotiated = negotiate(ControlMessage::Error { message: "x".into() }, peer());
        assert!(negotiated.is_err());
    }

    #[test]
    fn tcp_send_copies_every_byte() {
        let mut source = Cursor::new(b"0123456789".to_vec());
        let mut sink = Vec::new();
        let result = send_tcp(&mut source, &mut sink, 4).unwrap();
        assert_eq!(sink, b"0123456789");
        assert_eq!(result.bytes_sent, 10);
        assert_eq!(result.protocol, Mode::Tcp);
        assert_eq!(result.packets, None);
    }

    #[test]
    fn tcp_send_of_empty_source() {
        let mut sink = Vec::new();
        let result = send_tcp(&mut io::empty(), &mut sink, 65536).unwrap();
        assert!(sink.is_empty());
        assert_eq!(result.bytes_sent, 0);
        assert!(result.elapsed_s < 1.0);
    }

    /// Yields at most three bytes per read.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(3);
            self.0.read(&mut buf[..len])
        }
    }

    #[test]
    fn chunks_are_full_despite_short_reads() {
        let mut source = Trickle(Cursor::new(b"0123456789".to_vec()));
        let mut buf = [0u8; 4];
        let sizes: Vec<usize> = std::iter::from_fn(|| match read_chunk(&mut source, &mut buf) {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        })
        .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn udp_chunk_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"abc").unwrap();

        let session = TransferSession::open(Mode::Udp, &path, 1 << 20, None).unwrap();
        assert_eq!(session.chunk_size, MAX_DATAGRAM_PAYLOAD);
        let session = TransferSession::open(Mode::Tcp, &path, 1 << 20, None).unwrap();
        assert_eq!(session.chunk_size, 1 << 20);
        assert_eq!(
            session.ready_info(),
            ReadyInfo {
                filename: "payload.bin".into(),
                filesize: 3,
                bufsize: 1 << 20,
            }
        );
    }

    #[test]
    fn missing_source_is_a_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TransferSession::open(Mode::Tcp, &dir.path().join("absent"), 4, None).unwrap_err();
        assert!(matches!(err, SessionError::FileSystem { .. }));
    }
}
