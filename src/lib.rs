pub mod client;
pub mod common;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{ClientConfig, ClientReport, Completion};
pub use error::SessionError;
pub use protocol::{ControlMessage, Mode, TransferResult};
pub use server::{Server, ServerConfig};
