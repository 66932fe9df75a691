//! Control channel wire format.
//!
//! Every control message is one JSON object on one line. The four message
//! kinds are told apart by their discriminating key (`mode`, `status`,
//! `error`, `result`); [`ControlMessage::decode`] turns a line into the closed
//! enum or a [`DecodeError`].

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Tcp => "TCP",
            Mode::Udp => "UDP",
        }
    }

    /// Prefix of the client's output file, e.g. `received_tcp_`.
    pub fn output_prefix(self) -> &'static str {
        match self {
            Mode::Tcp => "received_tcp_",
            Mode::Udp => "received_udp_",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Mode::Tcp),
            "UDP" => Ok(Mode::Udp),
            other => Err(DecodeError::UnknownMode(other.to_string())),
        }
    }
}

/// File metadata announced before any payload byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInfo {
    pub filename: String,
    pub filesize: u64,
    pub bufsize: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub protocol: Mode,
    pub bytes_sent: u64,
    /// Seconds spent inside the send loop only.
    pub elapsed_s: f64,
    /// Datagram count, UDP only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
}

impl TransferResult {
    /// Bytes per second over the timed send loop, if any time elapsed.
    pub fn throughput(&self) -> Option<f64> {
        (self.elapsed_s > 0.0).then(|| self.bytes_sent as f64 / self.elapsed_s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Client to server. `udp_port` is required for [`Mode::Udp`]; that rule
    /// is enforced by the server during negotiation, not by decoding.
    ModeRequest { mode: Mode, udp_port: Option<u16> },
    Ready(ReadyInfo),
    Error { message: String },
    Result(TransferResult),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control message is not a JSON object")]
    NotAnObject,
    #[error("control message matches no known shape")]
    UnknownShape,
    #[error("unknown mode {0:?}")]
    UnknownMode(String),
    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("control line is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("control line exceeds {limit} bytes")]
    TooLong { limit: usize },
}

/// Longest control line accepted, terminator included.
pub const MAX_CONTROL_LINE: usize = 64 * 1024;

const READY_STATUS: &str = "ready";

#[derive(Serialize, Deserialize)]
struct ModeRequestWire {
    mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    udp_port: Option<u16>,
}

#[derive(Serialize, Deserialize)]
struct ReadyWire {
    status: String,
    filename: String,
    filesize: u64,
    bufsize: usize,
}

#[derive(Serialize, Deserialize)]
struct ErrorWire {
    error: String,
}

#[derive(Serialize, Deserialize)]
struct ResultWire {
    result: TransferResult,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    ModeRequest,
    Ready,
    Error,
    Result,
}

impl Kind {
    const DISCRIMINANTS: [(&'static str, Kind); 4] = [
        ("mode", Kind::ModeRequest),
        ("status", Kind::Ready),
        ("error", Kind::Error),
        ("result", Kind::Result),
    ];

    fn name(self) -> &'static str {
        match self {
            Kind::ModeRequest => "mode request",
            Kind::Ready => "ready response",
            Kind::Error => "error response",
            Kind::Result => "result response",
        }
    }

    fn of(object: &Map<String, Value>) -> Result<Self, DecodeError> {
        let mut found = Self::DISCRIMINANTS
            .iter()
            .filter(|(key, _)| object.contains_key(*key))
            .map(|(_, kind)| *kind);
        match (found.next(), found.next()) {
            (Some(kind), None) => Ok(kind),
            _ => Err(DecodeError::UnknownShape),
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(kind: Kind, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed {
        kind: kind.name(),
        reason: e.to_string(),
    })
}

impl ControlMessage {
    /// Encodes the message as a single JSON line, terminator included.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut line = match self {
            ControlMessage::ModeRequest { mode, udp_port } => serde_json::to_string(&ModeRequestWire {
                mode: mode.as_str().to_string(),
                udp_port: *udp_port,
            })?,
            ControlMessage::Ready(info) => serde_json::to_string(&ReadyWire {
                status: READY_STATUS.to_string(),
                filename: info.filename.clone(),
                filesize: info.filesize,
                bufsize: info.bufsize,
            })?,
            ControlMessage::Error { message } => serde_json::to_string(&ErrorWire {
                error: message.clone(),
            })?,
            ControlMessage::Result(result) => serde_json::to_string(&ResultWire {
                result: result.clone(),
            })?,
        };
        line.push('\n');
        Ok(line)
    }

    /// Decodes one line; surrounding whitespace (including the terminator) is ignored.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(line.trim())?;
        let kind = match &value {
            Value::Object(object) => Kind::of(object)?,
            _ => return Err(DecodeError::NotAnObject),
        };

        match kind {
            Kind::ModeRequest => {
                let wire: ModeRequestWire = typed(kind, value)?;
                Ok(ControlMessage::ModeRequest {
                    mode: wire.mode.parse()?,
                    udp_port: wire.udp_port,
                })
            }
            Kind::Ready => {
                let wire: ReadyWire = typed(kind, value)?;
                if wire.status != READY_STATUS {
                    return Err(DecodeError::Malformed {
                        kind: kind.name(),
                        reason: format!("status is {:?}", wire.status),
                    });
                }
                Ok(ControlMessage::Ready(ReadyInfo {
                    filename: wire.filename,
                    filesize: wire.filesize,
                    bufsize: wire.bufsize,
                }))
            }
            Kind::Error => {
                let wire: ErrorWire = typed(kind, value)?;
                Ok(ControlMessage::Error { message: wire.error })
            }
            Kind::Result => {
                let wire: ResultWire = typed(kind, value)?;
                Ok(ControlMessage::Result(wire.result))
            }
        }
    }
}

/// Per-session lifecycle shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Transferring,
    ReportingResult,
    Closed,
    ClosedOnError,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::ClosedOnError)
    }
}

/// The control connection. Reads go through one buffer so that payload bytes
/// which arrive right behind a control line are not lost when the TCP data
/// path reads from the same socket.
#[derive(Debug)]
pub struct ControlChannel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl ControlChannel {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn connect(addr: &str) -> io::Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.writer.peer_addr()
    }

    pub fn send(&mut self, msg: &ControlMessage) -> io::Result<()> {
        let line = msg.encode()?;
        trace!(line = line.trim_end(), "control send");
        self.writer.write_all(line.as_bytes())
    }

    /// Blocks until a full line arrives. `Ok(None)` means the peer closed the
    /// connection; that is end of session, not a malformed message.
    /// Lines longer than [`MAX_CONTROL_LINE`] are rejected without buffering the rest.
    pub fn recv(&mut self) -> Result<Option<ControlMessage>, SessionError> {
        let mut line = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_CONTROL_LINE as u64)
            .read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if n == MAX_CONTROL_LINE && !line.ends_with(b"\n") {
            return Err(DecodeError::TooLong {
                limit: MAX_CONTROL_LINE,
            }
            .into());
        }
        let text = std::str::from_utf8(&line).map_err(DecodeError::Utf8)?;
        trace!(line = text.trim_end(), "control recv");
        Ok(Some(ControlMessage::decode(text)?))
    }

    pub fn shutdown(&self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

impl Read for ControlChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Raw payload goes straight to the socket, unframed.
impl Write for ControlChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
