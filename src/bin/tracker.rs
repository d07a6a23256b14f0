use chunknet::node::{self, PortRange};
use chunknet::tracker::node::Tracker;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Cli {
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    #[clap(short, long, default_value = "9000")]
    port: u16,
    #[clap(short, long, help = "dynamic port range, e.g. 49152-65535")]
    dynamic_port_range: Option<PortRange>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let tracker = Arc::new(Tracker::new(
        args.host.clone(),
        args.port,
        args.dynamic_port_range,
    ));
    node::listen(&format!("{}:{}", args.host, args.port), tracker)
}
