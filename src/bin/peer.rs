use anyhow::{bail, Context};
use chunknet::node::PortRange;
use chunknet::peer::node::{CommandSource, Peer, PeerConfig, ScriptedCommand};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Cli {
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    #[clap(short, long)]
    port: u16,
    #[clap(long, default_value = "127.0.0.1")]
    tracker_host: String,
    #[clap(long, default_value = "9000")]
    tracker_port: u16,
    #[clap(short, long, help = "dynamic port range, e.g. 49152-65535")]
    dynamic_port_range: Option<PortRange>,
    #[clap(short = 't', long, default_value = "4", help = "number of download worker threads")]
    num_download_threads: usize,
    #[clap(short, long, help = "name of this peer; used as the chunk dir name")]
    name: Option<String>,
    #[clap(short, long, help = "run the scripted commands instead of reading stdin")]
    auto: bool,
    #[clap(short, long, help = "(auto mode) path to a JSON command file")]
    command_file: Option<PathBuf>,
    #[clap(short = 'j', long, help = "(auto mode) inline JSON with all commands")]
    command_json: Option<String>,
    #[clap(short, long, help = "(auto mode) pause for ENTER between commands")]
    step: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let source = if args.auto {
        let text = match (&args.command_file, &args.command_json) {
            (Some(path), _) => fs::read_to_string(path)
                .with_context(|| format!("cannot read command file {}", path.display()))?,
            (None, Some(inline)) => inline.clone(),
            (None, None) => bail!("auto mode needs --command-file or --command-json"),
        };
        let commands: Vec<ScriptedCommand> =
            serde_json::from_str(&text).context("malformed command script")?;
        CommandSource::Script {
            commands,
            step: args.step,
        }
    } else {
        CommandSource::Interactive
    };

    let peer = Peer::new(PeerConfig {
        host: args.host,
        port: args.port,
        tracker_host: args.tracker_host,
        tracker_port: args.tracker_port,
        num_download_threads: args.num_download_threads,
        name: args.name,
        port_range: args.dynamic_port_range,
    })?;
    Peer::run(Arc::new(peer), source)
}
