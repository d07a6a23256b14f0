use crate::chunk::{self, ChunkStore};
use crate::node;
use crate::peer::queue::{DownloadTask, Scheme, TaskQueue};
use crate::protocol::{Action, RegChunkReply};
use crate::wire;
use anyhow::{bail, Context, Result};
use crossbeam::channel::{tick, Receiver, Sender};
use log::{debug, error, warn};
use rand::seq::SliceRandom;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long a worker blocks on an empty queue before re-checking its stop
/// flag.
const POP_TIMEOUT: Duration = Duration::from_millis(500);

/// Supervisor cadence for progress rendering and fail fan-out.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Facilities one download shares between all of its workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: ChunkStore,
    pub self_address: String,
    pub tracker_host: String,
    pub tracker_port: u16,
}

/// A chunk that made it: where it came from and who else had it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub chunkid: u32,
    pub downloaded_from: String,
    pub candidates: Vec<String>,
}

/// Worker loop: pop a task, fetch the chunk from one of its candidates,
/// verify, persist, advertise. A failed attempt blacklists that candidate
/// for this download and re-queues the task; a task with no candidates left
/// fails the whole download.
pub fn worker_loop(
    name: usize,
    ctx: &WorkerContext,
    queue: &TaskQueue,
    stop: &AtomicBool,
    fail: &AtomicBool,
    reports: &Sender<ChunkReport>,
) {
    debug!("worker {} started", name);
    while !stop.load(Ordering::SeqCst) {
        let Some((priority, mut task)) = queue.pop_timeout(POP_TIMEOUT) else {
            continue;
        };
        let Some(address) = task.candidates.choose(&mut rand::thread_rng()).cloned() else {
            queue.task_done();
            fail.store(true, Ordering::SeqCst);
            break;
        };
        match fetch_chunk(ctx, &task, &address) {
            Ok(report) => {
                let _ = reports.send(report);
                queue.task_done();
            }
            Err(err) => {
                warn!(
                    "chunk {} of {} from {} failed: {:#}",
                    task.chunkid, task.filename, address, err
                );
                task.candidates.retain(|candidate| candidate != &address);
                if task.candidates.is_empty() {
                    warn!(
                        "no more peers available on chunk {}; download fail",
                        task.chunkid
                    );
                    queue.task_done();
                    fail.store(true, Ordering::SeqCst);
                    break;
                }
                let priority = match task.scheme {
                    // one source fewer makes the chunk rarer; pull it sooner
                    Scheme::RarestFirst => priority - 1,
                    Scheme::Normal => priority,
                };
                queue.push(priority, task);
                queue.task_done();
            }
        }
    }
    debug!("worker {} stopped", name);
}

/// Fetch one chunk from `address`, verify its digest, persist it, and
/// advertise this peer as a new source. An empty body means the remote does
/// not hold the chunk and counts as a mismatch.
fn fetch_chunk(ctx: &WorkerContext, task: &DownloadTask, address: &str) -> Result<ChunkReport> {
    let (host, port) = node::split_address(address)?;
    let bytes = wire::request(
        host,
        port,
        &ctx.self_address,
        Action::Download,
        json!({ "filename": task.filename, "chunkid": task.chunkid }),
    )?;
    if bytes.is_empty() {
        bail!("peer has no copy of the chunk");
    }
    let digest = chunk::md5_hex(&bytes);
    if digest != task.md5 {
        bail!("digest {} does not match expected {}", digest, task.md5);
    }
    ctx.store.write_chunk(&task.filename, task.chunkid, &bytes)?;

    let reply = wire::request_json(
        &ctx.tracker_host,
        ctx.tracker_port,
        &ctx.self_address,
        Action::RegChunk,
        json!({ "filename": task.filename, "chunkid": task.chunkid, "md5": task.md5 }),
    )?;
    let ack: RegChunkReply =
        serde_json::from_value(reply).context("malformed reg_chunk reply")?;
    if !ack.result {
        error!(
            "tracker refused chunk {} of {}",
            task.chunkid, task.filename
        );
    }
    Ok(ChunkReport {
        chunkid: task.chunkid,
        downloaded_from: address.to_string(),
        candidates: task.candidates.clone(),
    })
}

/// Supervisor loop: render progress on a tick, and once the fail flag goes
/// up, stop the workers and drain the queue so the caller's `join`
/// resolves. Returns the completion reports it collected.
pub fn supervisor_loop(
    label: &str,
    total: usize,
    queue: &TaskQueue,
    stop: &AtomicBool,
    fail: &AtomicBool,
    reports: Receiver<ChunkReport>,
) -> Vec<ChunkReport> {
    debug!("supervisor started");
    let ticker = tick(TICK_INTERVAL);
    let mut completed = Vec::new();
    loop {
        crossbeam::select! {
            recv(reports) -> report => match report {
                Ok(report) => completed.push(report),
                // every worker is gone, nothing more can arrive
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                if fail.load(Ordering::SeqCst) {
                    break;
                }
                render_progress(label, completed.len(), total);
            }
        }
    }
    // runs on the failure path no matter which arm broke the loop: the last
    // worker dying can disconnect the channel before the next tick
    if fail.load(Ordering::SeqCst) {
        stop.store(true, Ordering::SeqCst);
        queue.drain();
    }
    while let Ok(report) = reports.try_recv() {
        completed.push(report);
    }
    debug!("supervisor stopped");
    completed
}

fn render_progress(label: &str, completed: usize, total: usize) {
    let percentage = completed as f64 / total as f64;
    let marks = (percentage * 50.0) as usize;
    eprint!("\r{}{}> {:.1}%", label, "=".repeat(marks), percentage * 100.0);
    let _ = std::io::stderr().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn task(chunkid: u32) -> DownloadTask {
        DownloadTask {
            filename: "f1.txt".to_string(),
            chunkid,
            md5: format!("{:032x}", chunkid),
            scheme: Scheme::Normal,
            candidates: vec!["127.0.0.1:9001".to_string()],
        }
    }

    #[test]
    fn test_supervisor_drains_queue_on_fail() {
        let queue = Arc::new(TaskQueue::new());
        queue.push(0, task(0));
        queue.push(1, task(1));
        let stop = Arc::new(AtomicBool::new(false));
        let fail = Arc::new(AtomicBool::new(true));
        let (tx, rx) = crossbeam::channel::unbounded();

        let supervisor = thread::spawn({
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            let fail = Arc::clone(&fail);
            move || supervisor_loop("test", 2, &queue, &stop, &fail, rx)
        });

        // resolves only once the supervisor has drained the queue
        queue.join();
        assert!(queue.is_empty());
        assert!(stop.load(Ordering::SeqCst));
        drop(tx);
        assert!(supervisor.join().unwrap().is_empty());
    }

    #[test]
    fn test_supervisor_collects_reports_until_workers_disconnect() {
        let queue = Arc::new(TaskQueue::new());
        let stop = Arc::new(AtomicBool::new(false));
        let fail = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam::channel::unbounded();

        let supervisor = thread::spawn({
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            let fail = Arc::clone(&fail);
            move || supervisor_loop("test", 2, &queue, &stop, &fail, rx)
        });

        for chunkid in [1u32, 0] {
            tx.send(ChunkReport {
                chunkid,
                downloaded_from: "127.0.0.1:9001".to_string(),
                candidates: vec!["127.0.0.1:9001".to_string()],
            })
            .unwrap();
        }
        drop(tx);

        let completed = supervisor.join().unwrap();
        assert_eq!(completed.len(), 2);
    }
}
