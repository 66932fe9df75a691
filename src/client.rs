use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::common::{DEFAULT_BUFSIZE, DEFAULT_PORT, DEFAULT_UDP_TIMEOUT_SECS};
use crate::error::SessionError;
use crate::protocol::{ControlChannel, ControlMessage, Mode, ReadyInfo, SessionState, TransferResult};

/// Receive buffer for one datagram; comfortably above the largest UDP payload.
pub const RECV_DATAGRAM_CAPACITY: usize = 65_536 + 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    /// Read size for the TCP payload.
    pub bufsize: usize,
    /// How long the UDP receiver waits for the next datagram before giving up.
    pub udp_timeout: Duration,
    pub output_dir: PathBuf,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: DEFAULT_PORT,
            bufsize: DEFAULT_BUFSIZE,
            udp_timeout: Duration::from_secs(DEFAULT_UDP_TIMEOUT_SECS),
            output_dir: PathBuf::from("."),
        }
    }

    pub fn server_addr(&self) -> String {
        self.server.clone() + ":" + &self.port.to_string()
    }
}

/// Whether the receiver collected the whole announced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Complete,
    /// The UDP receiver timed out first.
    Partial,
}

#[derive(Debug)]
pub struct ClientReport {
    pub mode: Mode,
    pub ready: ReadyInfo,
    pub output_path: PathBuf,
    pub received: u64,
    pub completion: Completion,
    /// `None` when the server's result line was missing or unusable.
    pub result: Option<TransferResult>,
    pub finished_at: DateTime<Local>,
}

impl fmt::Display for ClientReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Received {} of {} bytes into {} ({:?})",
            self.received,
            self.ready.filesize,
            self.output_path.display(),
            self.completion
        )?;
        match &self.result {
            Some(result) => {
                write!(
                    f,
                    "[RESULT] protocol={}, bytes_sent={}, elapsed_s={:.6}",
                    result.protocol, result.bytes_sent, result.elapsed_s
                )?;
                if let Some(packets) = result.packets {
                    write!(f, ", packets={}", packets)?;
                }
                if let Some(throughput) = result.throughput() {
                    write!(f, ", throughput={:.2} MB/s", throughput / 1024.0 / 1024.0)?;
                }
            }
            None => write!(f, "[RESULT] not received")?,
        }
        write!(f, "\nFinished at {}", self.finished_at.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// `received_<mode>_<name>`, keeping only the last component of the announced name.
pub fn output_name(mode: Mode, announced: &str) -> Result<String, SessionError> {
    let name = Path::new(announced)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| SessionError::Negotiation(format!("unusable filename {:?}", announced)))?;
    Ok(format!("{}{}", mode.output_prefix(), name))
}

/// Copies exactly `expected` bytes from the stream. EOF before that is fatal.
pub fn receive_tcp<R: Read, W: Write>(
    source: &mut R,
    sink: &mut W,
    expected: u64,
    bufsize: usize,
) -> Result<u64, SessionError> {
    let mut buf = vec![0u8; bufsize.max(1)];
    let mut received = 0u64;

    while received < expected {
        let want = (expected - received).min(buf.len() as u64) as usize;
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => return Err(SessionError::PeerClosed { received, expected }),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        sink.write_all(&buf[..n])?;
        received += n as u64;
    }

    Ok(received)
}

/// Collects datagrams until `expected` bytes arrived or `timeout` passes
/// without one. A timeout is reported as [`Completion::Partial`], not an error.
/// With `sender` set, datagrams from any other IP are dropped.
pub fn receive_udp<W: Write>(
    socket: &UdpSocket,
    sink: &mut W,
    expected: u64,
    timeout: Duration,
    sender: Option<IpAddr>,
) -> io::Result<(u64, Completion)> {
    socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    let mut buf = vec![0u8; RECV_DATAGRAM_CAPACITY];
    let mut received = 0u64;

    while received < expected {
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => continue,
            Ok((n, from)) if sender.is_some_and(|ip| ip != from.ip()) => {
                debug!(%from, len = n, "ignoring datagram from a foreign sender");
            }
            Ok((n, _from)) => {
                let take = (expected - received).min(n as u64) as usize;
                sink.write_all(&buf[..take])?;
                received += take as u64;
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                warn!(received, expected, ?timeout, "UDP receive timed out before the whole file arrived");
                return Ok((received, Completion::Partial));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok((received, Completion::Complete))
}

fn udp_socket_like(peer: SocketAddr) -> io::Result<UdpSocket> {
    match peer {
        SocketAddr::V4(_) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

fn await_ready(control: &mut ControlChannel) -> Result<ReadyInfo, SessionError> {
    match control.recv()? {
        Some(ControlMessage::Ready(ready)) => Ok(ready),
        Some(ControlMessage::Error { message }) => Err(SessionError::Rejected(message)),
        Some(other) => Err(SessionError::Negotiation(format!("expected ready response, got {:?}", other))),
        None => Err(SessionError::Negotiation(
            "server closed the connection before it was ready".to_string(),
        )),
    }
}

/// Reads the result line. Problems here are logged, never fatal: the file is already written.
fn await_result(control: &mut ControlChannel) -> Option<TransferResult> {
    match control.recv() {
        Ok(Some(ControlMessage::Result(result))) => Some(result),
        Ok(Some(other)) => {
            warn!(message = ?other, "expected a result response");
            None
        }
        Ok(None) => {
            warn!("server closed the connection without a result");
            None
        }
        Err(e) => {
            warn!(error = %e, "could not read the result");
            None
        }
    }
}

/// Runs one whole session against the server and writes the received file.
pub fn run_session(config: &ClientConfig, mode: Mode) -> Result<ClientReport, SessionError> {
    let mut control = ControlChannel::connect(&config.server_addr())?;
    let peer = control.peer_addr()?;
    debug!(%peer, state = ?SessionState::Negotiating, "session state");

    // Bound before the request so no datagram can precede the socket.
    let udp_socket = match mode {
        Mode::Tcp => None,
        Mode::Udp => Some(udp_socket_like(peer)?),
    };
    let udp_port = match &udp_socket {
        Some(socket) => Some(socket.local_addr()?.port()),
        None => None,
    };
    if let Some(port) = udp_port {
        info!(port, "local UDP port chosen");
    }

    control.send(&ControlMessage::ModeRequest { mode, udp_port })?;
    let ready = await_ready(&mut control)?;
    info!(filename = %ready.filename, filesize = ready.filesize, %mode, "server ready");

    let output_path = config.output_dir.join(output_name(mode, &ready.filename)?);
    let mut sink = BufWriter::new(File::create(&output_path)?);

    debug!(%peer, state = ?SessionState::Transferring, "session state");
    let (received, completion) = match &udp_socket {
        None => {
            let received = receive_tcp(&mut control, &mut sink, ready.filesize, config.bufsize)?;
            (received, Completion::Complete)
        }
        Some(socket) => receive_udp(socket, &mut sink, ready.filesize, config.udp_timeout, Some(peer.ip()))?,
    };
    sink.flush()?;
    drop(udp_socket);
    info!(received, expected = ready.filesize, path = %output_path.display(), "payload stored");

    debug!(%peer, state = ?SessionState::ReportingResult, "session state");
    let result = await_result(&mut control);
    control.shutdown();
    debug!(%peer, state = ?SessionState::Closed, "session state");

    Ok(ClientReport {
        mode,
        ready,
        output_path,
        received,
        completion,
        result,
        finished_at: Local::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn output_name_keeps_last_component() {
        assert_eq!(output_name(Mode::Tcp, "clip.mp4").unwrap(), "received_tcp_clip.mp4");
        assert_eq!(output_name(Mode::Udp, "../../etc/clip.mp4").unwrap(), "received_udp_clip.mp4");
        assert!(output_name(Mode::Tcp, "..").is_err());
        assert!(output_name(Mode::Tcp, "").is_err());
    }

    #[test]
    fn tcp_receive_stops_at_expected_size() {
        // Trailing bytes belong to the next control line and must stay unread.
        let mut source = Cursor::new(b"0123456789{\"result\"".to_vec());
        let mut sink = Vec::new();
        let received = receive_tcp(&mut source, &mut sink, 10, 4).unwrap();
        assert_eq!(received, 10);
        assert_eq!(sink, b"0123456789");
        assert_eq!(source.position(), 10);
    }

    #[test]
    fn tcp_receive_reports_early_close() {
        let mut source = Cursor::new(b"01234".to_vec());
        let mut sink = Vec::new();
        let err = receive_tcp(&mut source, &mut sink, 10, 4).unwrap_err();
        assert!(matches!(err, SessionError::PeerClosed { received: 5, expected: 10 }));
        assert_eq!(sink, b"01234");
    }

    #[test]
    fn udp_receive_times_out_as_partial() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"abcd", socket.local_addr().unwrap()).unwrap();

        let mut sink = Vec::new();
        let (received, completion) =
            receive_udp(&socket, &mut sink, 100, Duration::from_millis(200), None).unwrap();
        assert_eq!(completion, Completion::Partial);
        assert_eq!(received, 4);
        assert_eq!(sink, b"abcd");
    }

    #[test]
    fn udp_receive_drops_foreign_datagrams() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let stray = UdpSocket::bind("127.0.0.1:0").unwrap();
        stray.send_to(b"junk", socket.local_addr().unwrap()).unwrap();

        let server_ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let mut sink = Vec::new();
        let (received, completion) =
            receive_udp(&socket, &mut sink, 10, Duration::from_millis(200), Some(server_ip)).unwrap();
        assert_eq!((received, completion), (0, Completion::Partial));
        assert!(sink.is_empty());
    }

    #[test]
    fn udp_receive_of_empty_file_needs_no_datagram() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut sink = Vec::new();
        let (received, completion) = receive_udp(&socket, &mut sink, 0, Duration::from_secs(5), None).unwrap();
        assert_eq!((received, completion), (0, Completion::Complete));
    }

    #[test]
    fn report_mentions_packets_for_udp() {
        let report = ClientReport {
            mode: Mode::Udp,
            ready: ReadyInfo {
                filename: "a.bin".into(),
                filesize: 10,
                bufsize: 4,
            },
            output_path: PathBuf::from("received_udp_a.bin"),
            received: 10,
            completion: Completion::Complete,
            result: Some(TransferResult {
                protocol: Mode::Udp,
                bytes_sent: 10,
                elapsed_s: 0.001,
                packets: Some(3),
            }),
            finished_at: Local::now(),
        };
        let text = report.to_string();
        assert!(text.contains("protocol=UDP"));
        assert!(text.contains("packets=3"));
        assert!(text.contains("Received 10 of 10 bytes"));
    }
}
