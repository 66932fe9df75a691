use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::DecodeError;

/// Everything that ends a transfer session early.
///
/// A UDP receive timeout is deliberately absent: it ends the receive loop but
/// not the session (see [`crate::client::Completion::Partial`]).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The request or the server's answer to it was unusable.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// The server answered with an error response.
    #[error("server rejected the session: {0}")]
    Rejected(String),
    #[error("peer closed the connection after {received} of {expected} bytes")]
    PeerClosed { received: u64, expected: u64 },
    #[error("source file {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bad control message: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
