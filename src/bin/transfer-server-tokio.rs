use clap::Parser;
use tcpudp_bench::common::{setup_tracing, ServerArgs};
use tcpudp_bench::server::serve_concurrent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let config = ServerArgs::parse().into_config();
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    serve_concurrent(listener, config).await
}
