/*
src/peer/download.rs

The concurrent download engine. A download runs in three stages:
preprocessing asks the tracker who holds which chunk and turns the answer
into a priority task queue; processing runs a pool of workers and a
supervisor over that queue; postprocessing re-checks the whole file's digest
and size before the reassembled copy is accepted.
*/

use crate::peer::queue::{build_task_queue, DownloadTask, Scheme};
use crate::peer::worker::{self, ChunkReport, WorkerContext};
use crate::protocol::{Action, ChunkRef, Locations};
use crate::wire;
use anyhow::{bail, Context, Result};
use crossbeam::channel;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Arguments of the top-level `download` command.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadArgs {
    pub filename: String,
    pub destination: PathBuf,
    pub scheme: Scheme,
}

/// How a download ended. Exactly one outcome is surfaced per download.
#[derive(Debug)]
pub enum Outcome {
    Success { reports: Vec<ChunkReport> },
    /// Nobody on the network holds the file.
    FileUnavailable,
    /// Some chunk ran out of sources.
    Failed,
    /// The reassembled chunks do not hash to the registered digest.
    DigestMismatch,
    /// The written file does not have the registered size.
    SizeMismatch,
}

/// Run one download end to end.
pub fn run(
    ctx: WorkerContext,
    num_workers: usize,
    label: &str,
    args: &DownloadArgs,
) -> Result<Outcome> {
    // preprocessing: ask the tracker who holds what
    let reply = wire::request_json(
        &ctx.tracker_host,
        ctx.tracker_port,
        &ctx.self_address,
        Action::Loc,
        json!({ "filename": args.filename, "include_md5": true }),
    )?;
    let locations: Locations = serde_json::from_value(reply).context("malformed loc reply")?;
    if locations.addresses.is_empty() {
        return Ok(Outcome::FileUnavailable);
    }
    let file_bytes = locations.bytes.context("loc reply is missing the file size")?;
    let file_md5 = locations.md5.context("loc reply is missing the file digest")?;

    // invert the manifest into one task per chunk
    let mut tasks: BTreeMap<u32, DownloadTask> = BTreeMap::new();
    for entry in &locations.addresses {
        let address = format!("{}:{}", entry.host, entry.port);
        for chunk in &entry.chunks {
            let ChunkRef::WithMd5 { id, md5 } = chunk else {
                bail!("tracker omitted chunk digests");
            };
            let task = tasks.entry(*id).or_insert_with(|| DownloadTask {
                filename: args.filename.clone(),
                chunkid: *id,
                md5: md5.clone(),
                scheme: args.scheme,
                candidates: Vec::new(),
            });
            if !task.candidates.contains(&address) {
                task.candidates.push(address.clone());
            }
        }
    }
    let chunkids: Vec<u32> = tasks.keys().copied().collect();
    let total = chunkids.len();
    let queue = Arc::new(build_task_queue(args.scheme, tasks.into_values().collect()));

    // processing: a supervisor plus a pool of workers over the shared queue
    let stop = Arc::new(AtomicBool::new(false));
    let fail = Arc::new(AtomicBool::new(false));
    let (report_tx, report_rx) = channel::unbounded();

    let supervisor = thread::spawn({
        let queue = Arc::clone(&queue);
        let stop = Arc::clone(&stop);
        let fail = Arc::clone(&fail);
        let label = label.to_string();
        move || worker::supervisor_loop(&label, total, &queue, &stop, &fail, report_rx)
    });
    let workers: Vec<_> = (0..num_workers.max(1))
        .map(|name| {
            let ctx = ctx.clone();
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            let fail = Arc::clone(&fail);
            let reports = report_tx.clone();
            thread::spawn(move || worker::worker_loop(name, &ctx, &queue, &stop, &fail, &reports))
        })
        .collect();
    drop(report_tx);

    queue.join();
    stop.store(true, Ordering::SeqCst);
    for handle in workers {
        let _ = handle.join();
    }
    let reports = supervisor.join().unwrap_or_default();

    // postprocessing: verify before the copy is accepted
    if fail.load(Ordering::SeqCst) {
        return Ok(Outcome::Failed);
    }
    let combined = ctx.store.combined_md5(&args.filename, &chunkids)?;
    if combined != file_md5 {
        return Ok(Outcome::DigestMismatch);
    }
    ctx.store
        .combine(&args.filename, &chunkids, &args.destination)?;
    let written = fs::metadata(&args.destination)?.len();
    if written != file_bytes {
        fs::remove_file(&args.destination)?;
        return Ok(Outcome::SizeMismatch);
    }
    Ok(Outcome::Success { reports })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{self, ChunkStore};
    use crate::node;
    use crate::peer::node::{Peer, PeerConfig};
    use crate::protocol::CHUNK_SIZE;
    use crate::tracker::node::Tracker;
    use serde_json::Value;
    use std::net::TcpListener;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn start_tracker() -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let tracker = Arc::new(Tracker::new("127.0.0.1".to_string(), port, None));
        thread::spawn(move || node::serve(listener, tracker));
        ("127.0.0.1".to_string(), port)
    }

    fn start_peer(name: &str, tracker_port: u16, dir: &TempDir) -> Arc<Peer> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = PeerConfig {
            host: "127.0.0.1".to_string(),
            port,
            tracker_host: "127.0.0.1".to_string(),
            tracker_port,
            num_download_threads: 3,
            name: Some(name.to_string()),
            port_range: None,
        };
        let store = ChunkStore::new(dir.path().join(name));
        let peer = Arc::new(Peer::with_store(config, store));
        let server = Arc::clone(&peer);
        thread::spawn(move || node::serve(listener, server));
        peer
    }

    fn write_source(dir: &Path, name: &str, len: usize) -> PathBuf {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    fn register(peer: &Peer, source: &Path) -> Value {
        peer.request_tracker(
            Action::RegFile,
            json!({ "files": [source.to_str().unwrap()] }),
        )
        .unwrap()
    }

    fn download(peer: &Peer, filename: &str, destination: PathBuf, scheme: Scheme) -> Outcome {
        peer.download(DownloadArgs {
            filename: filename.to_string(),
            destination,
            scheme,
        })
        .unwrap()
    }

    #[test]
    fn test_single_seeder_download() {
        let dir = tempdir().unwrap();
        let (_, tracker_port) = start_tracker();
        let seeder = start_peer("a", tracker_port, &dir);
        let downloader = start_peer("b", tracker_port, &dir);

        let source = write_source(dir.path(), "hello.txt", 0);
        fs::write(&source, b"Hello, world!\n").unwrap();
        let reply = register(&seeder, &source);
        assert_eq!(reply, json!([{ "hello.txt": true }]));

        let destination = dir.path().join("out").join("hello.txt");
        let outcome = download(&downloader, "hello.txt", destination.clone(), Scheme::Normal);

        let Outcome::Success { reports } = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(reports.len(), 1);
        assert_eq!(fs::metadata(&destination).unwrap().len(), 14);
        assert_eq!(
            chunk::file_md5(&destination).unwrap(),
            "746308829575e17c3331bbcb00c0898b"
        );

        // the downloader is now itself a registered source of every chunk
        let reply = downloader
            .request_tracker(Action::Loc, json!({ "filename": "hello.txt" }))
            .unwrap();
        let locations: Locations = serde_json::from_value(reply).unwrap();
        assert_eq!(locations.count, 2);
        assert!(locations
            .addresses
            .iter()
            .any(|entry| format!("{}:{}", entry.host, entry.port) == downloader.address()));
    }

    #[test]
    fn test_rarest_first_with_partial_seeder() {
        let dir = tempdir().unwrap();
        let (_, tracker_port) = start_tracker();
        let seeder = start_peer("a", tracker_port, &dir);
        let partial = start_peer("c", tracker_port, &dir);
        let downloader = start_peer("b", tracker_port, &dir);

        let source = write_source(dir.path(), "three.bin", CHUNK_SIZE * 3);
        register(&seeder, &source);

        // the partial seeder holds only chunk 1 and advertises it
        let data = fs::read(&source).unwrap();
        let slice = &data[CHUNK_SIZE..CHUNK_SIZE * 2];
        partial.store().write_chunk("three.bin", 1, slice).unwrap();
        let reply = partial
            .request_tracker(
                Action::RegChunk,
                json!({ "filename": "three.bin", "chunkid": 1, "md5": chunk::md5_hex(slice) }),
            )
            .unwrap();
        assert_eq!(reply, json!({ "result": true }));

        let destination = dir.path().join("three.copy");
        let outcome = download(
            &downloader,
            "three.bin",
            destination.clone(),
            Scheme::RarestFirst,
        );

        assert!(matches!(outcome, Outcome::Success { .. }));
        assert_eq!(fs::read(&destination).unwrap(), data);
    }

    #[test]
    fn test_lying_seeder_fails_over() {
        let dir = tempdir().unwrap();
        let (_, tracker_port) = start_tracker();
        let liar = start_peer("x", tracker_port, &dir);
        let honest = start_peer("y", tracker_port, &dir);
        let downloader = start_peer("b", tracker_port, &dir);

        let source = write_source(dir.path(), "data.bin", CHUNK_SIZE * 2 + 100);
        register(&liar, &source);
        let data = fs::read(&source).unwrap();

        // the honest seeder holds every chunk and advertises each of them
        let digests = chunk::chunk_md5s(&source).unwrap();
        for (chunkid, slice) in data.chunks(CHUNK_SIZE).enumerate() {
            honest
                .store()
                .write_chunk("data.bin", chunkid as u32, slice)
                .unwrap();
            honest
                .request_tracker(
                    Action::RegChunk,
                    json!({
                        "filename": "data.bin",
                        "chunkid": chunkid,
                        "md5": digests[chunkid],
                    }),
                )
                .unwrap();
        }

        // now the first seeder starts lying about chunk 0
        liar.store().write_chunk("data.bin", 0, b"garbage").unwrap();

        let destination = dir.path().join("data.copy");
        let outcome = download(&downloader, "data.bin", destination.clone(), Scheme::Normal);

        assert!(matches!(outcome, Outcome::Success { .. }));
        assert_eq!(fs::read(&destination).unwrap(), data);
    }

    #[test]
    fn test_unrecoverable_chunk_fails_the_download() {
        let dir = tempdir().unwrap();
        let (_, tracker_port) = start_tracker();
        let liar = start_peer("x", tracker_port, &dir);
        let downloader = start_peer("b", tracker_port, &dir);

        let source = write_source(dir.path(), "data.bin", 200);
        register(&liar, &source);
        liar.store().write_chunk("data.bin", 0, b"garbage").unwrap();

        let destination = dir.path().join("data.copy");
        let outcome = download(&downloader, "data.bin", destination.clone(), Scheme::Normal);

        assert!(matches!(outcome, Outcome::Failed));
        assert!(!destination.exists());
    }

    #[test]
    fn test_unknown_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let (_, tracker_port) = start_tracker();
        let downloader = start_peer("b", tracker_port, &dir);

        let outcome = download(
            &downloader,
            "nope.bin",
            dir.path().join("nope.copy"),
            Scheme::Normal,
        );
        assert!(matches!(outcome, Outcome::FileUnavailable));
    }

    #[test]
    fn test_leave_clears_sole_seeder_files() {
        let dir = tempdir().unwrap();
        let (_, tracker_port) = start_tracker();
        let seeder = start_peer("a", tracker_port, &dir);

        let source = write_source(dir.path(), "solo.bin", 300);
        register(&seeder, &source);
        let reply = seeder.request_tracker(Action::List, json!({})).unwrap();
        assert_eq!(reply["count"], 1);

        seeder.request_tracker(Action::Leave, json!({})).unwrap();
        let reply = seeder.request_tracker(Action::List, json!({})).unwrap();
        assert_eq!(reply["count"], 0);
    }
}
