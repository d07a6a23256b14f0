use crate::chunk::{self, ChunkStore};
use crate::node::{self, Dispatch, PortRange, Reply};
use crate::peer::download::{self, DownloadArgs, Outcome};
use crate::peer::worker::WorkerContext;
use crate::protocol::{self, Action, FetchArgs, FileMeta, InspectArgs, Role};
use crate::wire;
use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Top-level directory for every peer's local chunk store.
pub const CHUNK_DIR_TOP_LEVEL: &str = "chunks";

/// Peer configuration, as supplied by the CLI.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    pub tracker_host: String,
    pub tracker_port: u16,
    pub num_download_threads: usize,
    pub name: Option<String>,
    pub port_range: Option<PortRange>,
}

/// A peer: serves chunks out of its local store and drives downloads by
/// consulting the tracker and fetching chunks directly from other peers.
pub struct Peer {
    config: PeerConfig,
    store: ChunkStore,
}

/// One entry of a scripted command file.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedCommand {
    #[serde(default)]
    pub wait_seconds: f64,
    pub command: String,
}

/// How the command loop is fed.
pub enum CommandSource {
    Interactive,
    Script {
        commands: Vec<ScriptedCommand>,
        step: bool,
    },
}

impl Peer {
    /// Build a peer. Its chunk store lives under `chunks/<name>`, or a
    /// fresh unique directory under `chunks/` when the peer is unnamed.
    pub fn new(config: PeerConfig) -> Result<Peer> {
        let root = match &config.name {
            Some(name) => {
                let root = Path::new(CHUNK_DIR_TOP_LEVEL).join(name);
                fs::create_dir_all(&root)?;
                root
            }
            None => {
                fs::create_dir_all(CHUNK_DIR_TOP_LEVEL)?;
                tempfile::tempdir_in(CHUNK_DIR_TOP_LEVEL)?.into_path()
            }
        };
        Ok(Peer {
            store: ChunkStore::new(root),
            config,
        })
    }

    /// Build a peer over an existing chunk store.
    pub fn with_store(config: PeerConfig, store: ChunkStore) -> Peer {
        Peer { config, store }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    fn label(&self) -> String {
        self.config.name.clone().unwrap_or_else(|| "peer".to_string())
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            self_address: self.address(),
            tracker_host: self.config.tracker_host.clone(),
            tracker_port: self.config.tracker_port,
        }
    }

    /// Send one action to the tracker, with `reg_file` preprocessing
    /// applied first.
    pub fn request_tracker(&self, action: Action, mut args: Value) -> Result<Value> {
        if action == Action::RegFile {
            self.preprocess_reg_file(&mut args)?;
        }
        Ok(wire::request_json(
            &self.config.tracker_host,
            self.config.tracker_port,
            &self.address(),
            action,
            args,
        )?)
    }

    /// Expand each local path in `args.files` into its registration
    /// metadata and split the file into the local chunk store. Paths that
    /// do not exist are dropped.
    fn preprocess_reg_file(&self, args: &mut Value) -> Result<()> {
        let Value::Object(map) = args else {
            bail!("reg_file args must be an object");
        };
        let paths: Vec<String> =
            serde_json::from_value(map.get("files").cloned().unwrap_or_else(|| json!([])))
                .context("reg_file expects a list of file paths")?;
        let mut files = Vec::new();
        for path in paths {
            let path = PathBuf::from(path);
            if !path.exists() {
                warn!("file does not exist: {}", path.display());
                continue;
            }
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("bad file name: {}", path.display()))?
                .to_string();
            let bytes = fs::metadata(&path)?.len();
            let md5_full = chunk::file_md5(&path)?;
            let md5_chunks = chunk::chunk_md5s(&path)?;
            self.store.split(&path)?;
            files.push(FileMeta {
                filename,
                bytes,
                md5_full,
                md5_chunks,
            });
        }
        map.insert("count".to_string(), json!(files.len()));
        map.insert("files".to_string(), serde_json::to_value(&files)?);
        Ok(())
    }

    /// Run the `download` command end to end and report the outcome.
    pub fn download(&self, args: DownloadArgs) -> Result<Outcome> {
        let outcome = download::run(
            self.worker_context(),
            self.config.num_download_threads,
            &self.label(),
            &args,
        )?;
        self.report_outcome(&args, &outcome);
        Ok(outcome)
    }

    fn report_outcome(&self, args: &DownloadArgs, outcome: &Outcome) {
        match outcome {
            Outcome::FileUnavailable => info!(
                "Fail. Reason: file does not exist in network or no available peers have the file"
            ),
            Outcome::Failed => info!("Fail. Reason: download fail."),
            Outcome::DigestMismatch => info!("Fail. Reason: MD5 not match"),
            Outcome::SizeMismatch => info!("Fail. Reason: size not match."),
            Outcome::Success { reports } => {
                let chunk_information: Vec<String> = reports
                    .iter()
                    .take(20)
                    .map(|entry| {
                        format!(
                            "Chunk{}: downloaded from {}. Available from: {:?}",
                            entry.chunkid, entry.downloaded_from, entry.candidates
                        )
                    })
                    .collect();
                let cdots = if reports.len() > 20 { "\n......" } else { "" };
                info!(
                    "\n\n************************************************\n\
                     ****************DOWNLOAD SUCCESS****************\n\
                     ************************************************\n\n\
                     CHUNK INFORMATION\n{}{}\n\n\
                     FILE PATH\n{}\n\
                     ************************************************\n",
                    chunk_information.join("\n"),
                    cdots,
                    args.destination.display(),
                );
            }
        }
    }

    /// Parse `<action> <json-args>` and route it: tracker-bound actions go
    /// over the wire, `download` runs the local engine.
    pub fn execute(&self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let (name, rest) = line.split_once(' ').unwrap_or((line, "{}"));
        let action =
            Action::from_name(name).with_context(|| format!("unknown command: {}", name))?;
        let args: Value = serde_json::from_str(rest.trim())
            .with_context(|| format!("bad arguments for {}", name))?;
        match action.spec().request_to {
            Role::Tracker => {
                let reply = self.request_tracker(action, args)?;
                info!("response received: {}", reply);
            }
            Role::Peer => {
                let args: DownloadArgs = serde_json::from_value(args)
                    .context("download expects filename, destination, and scheme")?;
                self.download(args)?;
            }
        }
        Ok(())
    }

    /// Start the listener thread, then drive the command loop until its
    /// source is exhausted.
    pub fn run(peer: Arc<Peer>, source: CommandSource) -> Result<()> {
        let server = Arc::clone(&peer);
        let addr = peer.address();
        thread::spawn(move || {
            if let Err(err) = node::listen(&addr, server) {
                error!("listener failed: {:#}", err);
            }
        });

        match source {
            CommandSource::Interactive => {
                info!("{}", protocol::usage());
                let stdin = io::stdin();
                for line in stdin.lock().lines() {
                    let line = line?;
                    if let Err(err) = peer.execute(&line) {
                        error!("command failed: {:#}", err);
                    }
                }
            }
            CommandSource::Script { commands, step } => {
                for entry in commands {
                    if !step && entry.wait_seconds > 0.0 {
                        thread::sleep(Duration::from_secs_f64(entry.wait_seconds));
                    }
                    info!("request sent: {}", entry.command);
                    if let Err(err) = peer.execute(&entry.command) {
                        error!("command failed: {:#}", err);
                    }
                    // in step mode the pause comes after each command
                    if step {
                        eprint!("Please hit ENTER to continue: ");
                        let _ = io::stderr().flush();
                        let mut pause = String::new();
                        io::stdin().read_line(&mut pause)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn inspect(&self, variable: &str) -> Value {
        match variable {
            "address" => json!(self.address()),
            "name" => json!(self.config.name),
            "tmp_dir" => json!(self.store.root().display().to_string()),
            "num_download_threads" => json!(self.config.num_download_threads),
            "dynamic_port_range" => match self.config.port_range {
                Some(range) => json!(range.to_string()),
                None => Value::Null,
            },
            _ => Value::Null,
        }
    }
}

impl Dispatch for Peer {
    fn role(&self) -> Role {
        Role::Peer
    }

    fn handle(&self, action: Action, args: Value) -> Result<Reply> {
        match action {
            Action::Download => {
                let args: FetchArgs = serde_json::from_value(args)?;
                // an empty body tells the caller this peer has no copy
                let bytes = self
                    .store
                    .read_chunk(&args.filename, args.chunkid)?
                    .unwrap_or_default();
                Ok(Reply::Bytes(bytes))
            }
            Action::Inspect => {
                let args: InspectArgs = serde_json::from_value(args)?;
                Ok(Reply::Json(self.inspect(&args.variable)))
            }
            _ => bail!("{} is not served by a peer", action.name()),
        }
    }
}
