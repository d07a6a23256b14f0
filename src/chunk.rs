/*
src/chunk.rs

This file contains the logic for the on-disk chunk store. A file is split
into CHUNK_SIZE slices, each stored as its own file under
`<root>/<filename>/<chunkid>.chunk`. The same reads that produce the chunks
also drive both digests, so concatenating the chunk files in order always
reproduces the original file and its MD5.
*/

use crate::protocol::CHUNK_SIZE;
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Hex MD5 of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Fill `buf` from the reader, stopping early only at end-of-file.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Hex MD5 of a whole file, hashed in CHUNK_SIZE reads.
pub fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex MD5 of every CHUNK_SIZE slice of a file, in order.
pub fn chunk_md5s(path: &Path) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let mut digests = Vec::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        digests.push(md5_hex(&buf[..n]));
    }
    Ok(digests)
}

/// On-disk chunk store rooted at a peer's chunk directory.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> ChunkStore {
        ChunkStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_path(&self, filename: &str, chunkid: u32) -> PathBuf {
        self.root.join(filename).join(format!("{}.chunk", chunkid))
    }

    /// Read a stored chunk; `None` if this peer does not hold it.
    pub fn read_chunk(&self, filename: &str, chunkid: u32) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.chunk_path(filename, chunkid)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn write_chunk(&self, filename: &str, chunkid: u32, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(self.root.join(filename))?;
        fs::write(self.chunk_path(filename, chunkid), data)
    }

    /// Split a source file into chunk files; returns the number of chunks.
    /// The last chunk may be shorter than CHUNK_SIZE.
    pub fn split(&self, filepath: &Path) -> io::Result<u32> {
        let filename = filepath
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "source path has no file name")
            })?;
        let mut file = File::open(filepath)?;
        let mut buf = [0u8; CHUNK_SIZE];
        let mut chunkid = 0u32;
        loop {
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            self.write_chunk(filename, chunkid, &buf[..n])?;
            chunkid += 1;
        }
        Ok(chunkid)
    }

    /// Append chunk files to the destination path; `chunkids` must already
    /// be in ascending order.
    pub fn combine(&self, filename: &str, chunkids: &[u32], destination: &Path) -> io::Result<()> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut out = File::create(destination)?;
        for &chunkid in chunkids {
            let bytes = fs::read(self.chunk_path(filename, chunkid))?;
            out.write_all(&bytes)?;
        }
        Ok(())
    }

    /// Hex MD5 over the stored chunk files in the given order.
    pub fn combined_md5(&self, filename: &str, chunkids: &[u32]) -> io::Result<String> {
        let mut hasher = Md5::new();
        for &chunkid in chunkids {
            hasher.update(fs::read(self.chunk_path(filename, chunkid))?);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
