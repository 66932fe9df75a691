use std::io::{self, BufRead, Write};

use clap::Parser;
use tcpudp_bench::client::run_session;
use tcpudp_bench::common::{mode_from_choice, setup_tracing, ClientArgs};
use tcpudp_bench::Mode;
use tracing::error;

fn prompt_mode() -> io::Result<Mode> {
    println!("=== File transfer client ===");
    println!("Choose protocol:");
    println!("1) TCP");
    println!("2) UDP");
    print!("Option [1/2]: ");
    io::stdout().flush()?;

    let mut choice = String::new();
    io::stdin().lock().read_line(&mut choice)?;
    Ok(mode_from_choice(&choice))
}

fn main() -> anyhow::Result<()> {
    setup_tracing();
    let args = ClientArgs::parse();
    let mode = match args.mode() {
        Some(mode) => mode,
        None => prompt_mode()?,
    };

    match run_session(&args.to_config(), mode) {
        Ok(report) => println!("{}", report),
        Err(e) => error!(error = %e, "transfer failed"),
    }
    Ok(())
}
