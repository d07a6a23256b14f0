use crate::node::{Dispatch, PortRange, Reply};
use crate::protocol::{Action, InspectArgs, LeaveArgs, LocArgs, RegChunkArgs, RegFileArgs, Role};
use crate::tracker::index::Index;
use anyhow::Result;
use log::info;
use serde_json::{json, Map, Value};
use std::sync::Mutex;

/// The tracker node. One mutex over the index serializes every mutation, so
/// a digest check and the peer insert it guards are a single atomic step.
pub struct Tracker {
    index: Mutex<Index>,
    host: String,
    port: u16,
    port_range: Option<PortRange>,
}

impl Tracker {
    pub fn new(host: String, port: u16, port_range: Option<PortRange>) -> Tracker {
        Tracker {
            index: Mutex::new(Index::new()),
            host,
            port,
            port_range,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn inspect(&self, variable: &str) -> Value {
        match variable {
            "address" => json!(self.address()),
            "dynamic_port_range" => match self.port_range {
                Some(range) => json!(range.to_string()),
                None => Value::Null,
            },
            "files" => json!(self.index.lock().unwrap().filenames()),
            _ => Value::Null,
        }
    }
}

impl Dispatch for Tracker {
    fn role(&self) -> Role {
        Role::Tracker
    }

    fn handle(&self, action: Action, args: Value) -> Result<Reply> {
        match action {
            Action::RegFile => {
                let args: RegFileArgs = serde_json::from_value(args)?;
                let result = self
                    .index
                    .lock()
                    .unwrap()
                    .register_file(&args.address, &args.files);
                info!("registered {} file(s) for {}", args.files.len(), args.address);
                // ordered list of single-entry objects, matching the input order
                let body: Vec<Value> = result
                    .into_iter()
                    .map(|(filename, accepted)| {
                        let mut entry = Map::new();
                        entry.insert(filename, Value::Bool(accepted));
                        Value::Object(entry)
                    })
                    .collect();
                Ok(Reply::Json(Value::Array(body)))
            }
            Action::List => {
                let list = self.index.lock().unwrap().file_list();
                Ok(Reply::Json(serde_json::to_value(list)?))
            }
            Action::Loc => {
                let args: LocArgs = serde_json::from_value(args)?;
                let locations = self
                    .index
                    .lock()
                    .unwrap()
                    .file_locations(&args.filename, args.include_md5);
                Ok(Reply::Json(serde_json::to_value(locations)?))
            }
            Action::RegChunk => {
                let args: RegChunkArgs = serde_json::from_value(args)?;
                let result = self.index.lock().unwrap().register_chunk(
                    &args.address,
                    &args.filename,
                    args.chunkid,
                    &args.md5,
                );
                Ok(Reply::Json(json!({ "result": result })))
            }
            Action::Leave => {
                let args: LeaveArgs = serde_json::from_value(args)?;
                self.index.lock().unwrap().leave(&args.address);
                info!("{} left the network", args.address);
                Ok(Reply::Json(json!({ "result": true })))
            }
            Action::Inspect => {
                let args: InspectArgs = serde_json::from_value(args)?;
                Ok(Reply::Json(self.inspect(&args.variable)))
            }
            Action::Download => anyhow::bail!("download is served by peers"),
        }
    }
}
