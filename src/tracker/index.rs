use crate::protocol::{AddressChunks, ChunkRef, FileList, FileListEntry, FileMeta, Locations};
use std::collections::{HashMap, HashSet};

/// One chunk of an indexed file and the addresses known to hold a
/// byte-identical copy.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: u32,
    pub md5: String,
    pub peers: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub bytes: u64,
    pub md5: String,
    pub chunks: Vec<ChunkRecord>,
}

/// The tracker's in-memory directory of files, chunks, and their holders.
/// It never stores chunk bytes and does not persist across restarts.
#[derive(Debug, Default)]
pub struct Index {
    files: HashMap<String, FileRecord>,
}

impl Index {
    pub fn new() -> Index {
        Index::default()
    }

    /// Register new files for `address`. A filename that is already indexed
    /// is rejected, so the first registration's digests stay authoritative.
    pub fn register_file(&mut self, address: &str, files: &[FileMeta]) -> Vec<(String, bool)> {
        let mut result = Vec::with_capacity(files.len());
        for entry in files {
            if self.files.contains_key(&entry.filename) {
                result.push((entry.filename.clone(), false));
                continue;
            }
            let chunks = entry
                .md5_chunks
                .iter()
                .enumerate()
                .map(|(i, md5)| ChunkRecord {
                    id: i as u32,
                    md5: md5.clone(),
                    peers: HashSet::from([address.to_string()]),
                })
                .collect();
            self.files.insert(
                entry.filename.clone(),
                FileRecord {
                    bytes: entry.bytes,
                    md5: entry.md5_full.clone(),
                    chunks,
                },
            );
            result.push((entry.filename.clone(), true));
        }
        result
    }

    pub fn file_list(&self) -> FileList {
        FileList {
            count: self.files.len(),
            result: self
                .files
                .iter()
                .map(|(filename, record)| FileListEntry {
                    filename: filename.clone(),
                    bytes: record.bytes,
                })
                .collect(),
        }
    }

    /// Group a file's chunks by holder address. This is the authoritative
    /// input to a downloader's task construction.
    pub fn file_locations(&self, filename: &str, include_md5: bool) -> Locations {
        let Some(record) = self.files.get(filename) else {
            return Locations {
                bytes: None,
                md5: None,
                count: 0,
                addresses: Vec::new(),
            };
        };
        let mut by_address: HashMap<&String, Vec<ChunkRef>> = HashMap::new();
        for chunk in &record.chunks {
            for address in &chunk.peers {
                let entry = if include_md5 {
                    ChunkRef::WithMd5 {
                        id: chunk.id,
                        md5: chunk.md5.clone(),
                    }
                } else {
                    ChunkRef::Plain(chunk.id)
                };
                by_address.entry(address).or_default().push(entry);
            }
        }
        let addresses: Vec<AddressChunks> = by_address
            .into_iter()
            .filter_map(|(address, chunks)| {
                let (host, port) = address.rsplit_once(':')?;
                Some(AddressChunks {
                    host: host.to_string(),
                    port: port.parse().ok()?,
                    chunks,
                })
            })
            .collect();
        Locations {
            bytes: Some(record.bytes),
            md5: Some(record.md5.clone()),
            count: addresses.len(),
            addresses,
        }
    }

    /// Add `address` as a holder of one chunk. Succeeds only when the file
    /// is indexed, the id is in range, and the reported digest matches the
    /// record; the check and the insert happen under the same borrow.
    pub fn register_chunk(
        &mut self,
        address: &str,
        filename: &str,
        chunkid: u32,
        md5: &str,
    ) -> bool {
        let Some(record) = self.files.get_mut(filename) else {
            return false;
        };
        let Some(chunk) = record.chunks.get_mut(chunkid as usize) else {
            return false;
        };
        if chunk.md5 != md5 {
            return false;
        }
        chunk.peers.insert(address.to_string());
        true
    }

    /// Remove `address` from every chunk of every file, then erase files
    /// left with a chunk nobody holds; a file that cannot be served in full
    /// is not served at all.
    pub fn leave(&mut self, address: &str) {
        self.files.retain(|_, record| {
            let mut servable = true;
            for chunk in &mut record.chunks {
                chunk.peers.remove(address);
                if chunk.peers.is_empty() {
                    servable = false;
                }
            }
            servable
        });
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    pub fn file(&self, filename: &str) -> Option<&FileRecord> {
        self.files.get(filename)
    }

    pub fn filenames(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}
