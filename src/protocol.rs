use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Network-wide chunk length in bytes. Every node in a network must use the
/// same value, otherwise chunk digests will disagree.
pub const CHUNK_SIZE: usize = 1024;

/// Read increment for receiving a framed request; a read shorter than this
/// ends the message.
pub const BUFF_SIZE: usize = 4096;

/// The two node roles on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Tracker,
    Peer,
}

/// How an action's response is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Byte,
}

/// Every action a node can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    RegFile,
    List,
    Loc,
    RegChunk,
    Leave,
    Download,
    Inspect,
}

pub const ACTIONS: [Action; 7] = [
    Action::RegFile,
    Action::List,
    Action::Loc,
    Action::RegChunk,
    Action::Leave,
    Action::Download,
    Action::Inspect,
];

/// Per-action dispatch entry: which roles serve it, where the command loop
/// routes it, and how the response is encoded.
#[derive(Debug)]
pub struct CommandSpec {
    pub served_by: &'static [Role],
    pub request_to: Role,
    pub response: Encoding,
    pub args_hint: &'static str,
    pub help: &'static str,
}

static REG_FILE: CommandSpec = CommandSpec {
    served_by: &[Role::Tracker],
    request_to: Role::Tracker,
    response: Encoding::Json,
    args_hint: r#"{"files": [filepath1, filepath2]}"#,
    help: "register files by file paths",
};

static LIST: CommandSpec = CommandSpec {
    served_by: &[Role::Tracker],
    request_to: Role::Tracker,
    response: Encoding::Json,
    args_hint: "{}",
    help: "list files available",
};

static LOC: CommandSpec = CommandSpec {
    served_by: &[Role::Tracker],
    request_to: Role::Tracker,
    response: Encoding::Json,
    args_hint: r#"{"filename": filename, "include_md5": false}"#,
    help: "get addresses of peers that hold the requested file; \"include_md5\" is optional",
};

static REG_CHUNK: CommandSpec = CommandSpec {
    served_by: &[Role::Tracker],
    request_to: Role::Tracker,
    response: Encoding::Json,
    args_hint: r#"{"filename": filename, "chunkid": chunkid, "md5": chunk_md5}"#,
    help: "register a chunk of a file",
};

static LEAVE: CommandSpec = CommandSpec {
    served_by: &[Role::Tracker],
    request_to: Role::Tracker,
    response: Encoding::Json,
    args_hint: "{}",
    help: "remove this peer from the network",
};

static DOWNLOAD: CommandSpec = CommandSpec {
    served_by: &[Role::Peer],
    request_to: Role::Peer,
    response: Encoding::Byte,
    args_hint: r#"{"filename": filename, "destination": destination, "scheme": scheme}"#,
    help: "download a file by name; scheme is either \"normal\" or \"rarest_first\"",
};

static INSPECT: CommandSpec = CommandSpec {
    served_by: &[Role::Tracker, Role::Peer],
    request_to: Role::Tracker,
    response: Encoding::Json,
    args_hint: r#"{"variable": variable}"#,
    help: "inspect a variable in this node",
};

impl Action {
    pub fn from_name(name: &str) -> Option<Action> {
        match name {
            "reg_file" => Some(Action::RegFile),
            "list" => Some(Action::List),
            "loc" => Some(Action::Loc),
            "reg_chunk" => Some(Action::RegChunk),
            "leave" => Some(Action::Leave),
            "download" => Some(Action::Download),
            "inspect" => Some(Action::Inspect),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::RegFile => "reg_file",
            Action::List => "list",
            Action::Loc => "loc",
            Action::RegChunk => "reg_chunk",
            Action::Leave => "leave",
            Action::Download => "download",
            Action::Inspect => "inspect",
        }
    }

    pub fn spec(&self) -> &'static CommandSpec {
        match self {
            Action::RegFile => &REG_FILE,
            Action::List => &LIST,
            Action::Loc => &LOC,
            Action::RegChunk => &REG_CHUNK,
            Action::Leave => &LEAVE,
            Action::Download => &DOWNLOAD,
            Action::Inspect => &INSPECT,
        }
    }
}

/// Help text for the interactive command loop.
pub fn usage() -> String {
    let mut text = String::from("Available commands:\n\n");
    for (i, action) in ACTIONS.iter().enumerate() {
        let spec = action.spec();
        text.push_str(&format!(
            "{}. {} {}: {}\n",
            i + 1,
            action.name(),
            spec.args_hint,
            spec.help
        ));
    }
    text
}

/// Request envelope: `{"action": name, "args": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    pub args: Value,
}

/// File metadata a peer computes before sending `reg_file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub filename: String,
    pub bytes: u64,
    pub md5_full: String,
    pub md5_chunks: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegFileArgs {
    pub address: String,
    pub files: Vec<FileMeta>,
}

#[derive(Debug, Deserialize)]
pub struct LocArgs {
    pub filename: String,
    #[serde(default)]
    pub include_md5: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegChunkArgs {
    pub address: String,
    pub filename: String,
    pub chunkid: u32,
    pub md5: String,
}

#[derive(Debug, Deserialize)]
pub struct LeaveArgs {
    pub address: String,
}

/// Arguments of a peer-to-peer chunk fetch.
#[derive(Debug, Deserialize)]
pub struct FetchArgs {
    pub filename: String,
    pub chunkid: u32,
}

#[derive(Debug, Deserialize)]
pub struct InspectArgs {
    pub variable: String,
}

/// `list` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileList {
    pub count: usize,
    pub result: Vec<FileListEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileListEntry {
    pub filename: String,
    pub bytes: u64,
}

/// One chunk reference in a `loc` manifest: a bare id, or id plus digest
/// when the caller asked for `include_md5`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkRef {
    WithMd5 { id: u32, md5: String },
    Plain(u32),
}

/// Per-address chunk manifest in a `loc` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddressChunks {
    pub host: String,
    pub port: u16,
    pub chunks: Vec<ChunkRef>,
}

/// `loc` response: who holds which chunks of a file. `bytes` and `md5` are
/// absent when the file is not indexed.
#[derive(Debug, Serialize, Deserialize)]
pub struct Locations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    pub count: usize,
    pub addresses: Vec<AddressChunks>,
}

/// `reg_chunk` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegChunkReply {
    pub result: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_round_trip() {
        for action in ACTIONS {
            assert_eq!(Action::from_name(action.name()), Some(action));
        }
        assert_eq!(Action::from_name("announce"), None);
    }

    #[test]
    fn test_download_is_the_only_byte_action() {
        for action in ACTIONS {
            let spec = action.spec();
            if action == Action::Download {
                assert_eq!(spec.response, Encoding::Byte);
                assert_eq!(spec.served_by, &[Role::Peer]);
            } else {
                assert_eq!(spec.response, Encoding::Json);
                assert!(spec.served_by.contains(&Role::Tracker));
            }
        }
    }

    #[test]
    fn test_chunk_ref_wire_shapes() {
        let plain = serde_json::to_value(ChunkRef::Plain(3)).unwrap();
        assert_eq!(plain, serde_json::json!(3));

        let with_md5 = serde_json::to_value(ChunkRef::WithMd5 {
            id: 0,
            md5: "4b43b0aee35624cd95b910189b3dc231".to_string(),
        })
        .unwrap();
        assert_eq!(
            with_md5,
            serde_json::json!({ "id": 0, "md5": "4b43b0aee35624cd95b910189b3dc231" })
        );

        let parsed: Vec<ChunkRef> = serde_json::from_value(serde_json::json!([
            1,
            { "id": 2, "md5": "e22428ccf96cda9674a939c209ad1000" }
        ]))
        .unwrap();
        assert_eq!(parsed[0], ChunkRef::Plain(1));
        assert!(matches!(parsed[1], ChunkRef::WithMd5 { id: 2, .. }));
    }

    #[test]
    fn test_locations_omits_metadata_for_unknown_files() {
        let empty = Locations {
            bytes: None,
            md5: None,
            count: 0,
            addresses: Vec::new(),
        };
        let value = serde_json::to_value(&empty).unwrap();
        assert_eq!(value, serde_json::json!({ "count": 0, "addresses": [] }));
    }
}
