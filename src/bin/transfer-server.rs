use clap::Parser;
use tcpudp_bench::common::{setup_tracing, ServerArgs};
use tcpudp_bench::server::Server;

fn main() -> anyhow::Result<()> {
    setup_tracing();
    let args = ServerArgs::parse();
    let once = args.serve_once();
    let server = Server::bind(args.into_config())?;

    if once {
        server.serve_one()?;
        Ok(())
    } else {
        server.run()
    }
}
