use std::path::PathBuf;
use std::time::Duration;

use clap::builder::TypedValueParser;
use clap::{Parser, ValueEnum};

use crate::client::ClientConfig;
use crate::protocol::Mode;
use crate::server::ServerConfig;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_BUFSIZE: usize = 65536;
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_FILENAME: &str = "file_example_MP4_1920_18MG.mp4";

pub fn setup_tracing() {
    use tracing_subscriber::fmt::Subscriber;
    use tracing_subscriber::EnvFilter;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[derive(Parser, Debug)]
#[command(version, about = "Serve one file over TCP or UDP and time the send loop", long_about)]
pub struct ServerArgs {
    /// Address to bind the control listener to
    #[arg(long, value_name = "host", default_value = "0.0.0.0")]
    host: String,
    /// Control port
    #[arg(short, long, value_name = "port number", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// File to serve
    #[arg(short, long, value_name = "path", default_value = DEFAULT_FILENAME)]
    file: PathBuf,
    /// Chunk size in bytes
    #[arg(short, long, value_name = "bytes", default_value_t = DEFAULT_BUFSIZE,
          value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    bufsize: usize,
    /// Serve a single session and exit
    #[arg(long)]
    once: bool,
}

impl ServerArgs {
    pub fn serve_once(&self) -> bool {
        self.once
    }

    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            file: self.file,
            bufsize: self.bufsize,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Tcp,
    Udp,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Tcp => Mode::Tcp,
            ModeArg::Udp => Mode::Udp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Receive a file over TCP or UDP and report the server's timing", long_about)]
pub struct ClientArgs {
    /// Address of the server
    #[arg(short, long, value_name = "server address")]
    server: String,
    /// Control port of the server
    #[arg(short, long, value_name = "port number", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Read size for the TCP payload
    #[arg(short, long, value_name = "bytes", default_value_t = DEFAULT_BUFSIZE,
          value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
    bufsize: usize,
    /// Seconds of UDP silence before the receiver gives up
    #[arg(long, value_name = "seconds", default_value_t = DEFAULT_UDP_TIMEOUT_SECS)]
    udp_timeout: u64,
    /// Directory the received file is written to
    #[arg(short, long, value_name = "dir", default_value = ".")]
    output_dir: PathBuf,
    /// Transfer mode; prompts when omitted
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,
}

impl ClientArgs {
    pub fn mode(&self) -> Option<Mode> {
        self.mode.map(Mode::from)
    }

    pub fn to_config(&self) -> ClientConfig {
        ClientConfig {
            server: self.server.clone(),
            port: self.port,
            bufsize: self.bufsize,
            udp_timeout: Duration::from_secs(self.udp_timeout),
            output_dir: self.output_dir.clone(),
        }
    }
}

/// Maps the interactive menu answer to a mode. Only `1` selects TCP.
pub fn mode_from_choice(choice: &str) -> Mode {
    if choice.trim() == "1" {
        Mode::Tcp
    } else {
        Mode::Udp
    }
}
