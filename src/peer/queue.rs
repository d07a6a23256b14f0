use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Chunk selection policy for a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// Fetch chunks in file order.
    Normal,
    /// Fetch the chunks with the fewest sources first.
    RarestFirst,
}

/// One chunk to fetch, with the addresses still worth trying.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub filename: String,
    pub chunkid: u32,
    pub md5: String,
    pub scheme: Scheme,
    pub candidates: Vec<String>,
}

struct Entry {
    priority: i64,
    seq: u64,
    task: DownloadTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    // BinaryHeap is a max-heap; flip the comparison so the smallest
    // (priority, seq) pair pops first
    fn cmp(&self, other: &Entry) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    heap: BinaryHeap<Entry>,
    unfinished: usize,
    seq: u64,
}

/// Priority queue shared by the download workers. Each push is accounted as
/// an unfinished task until `task_done` acknowledges it, so `join` resolves
/// exactly when every task has been consumed, including re-queued retries.
pub struct TaskQueue {
    state: Mutex<State>,
    available: Condvar,
    idle: Condvar,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                unfinished: 0,
                seq: 0,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Queue a task; later pushes of equal priority pop in insertion order.
    pub fn push(&self, priority: i64, task: DownloadTask) {
        let mut state = self.state.lock().unwrap();
        let seq = state.seq;
        state.seq += 1;
        state.heap.push(Entry { priority, seq, task });
        state.unfinished += 1;
        self.available.notify_one();
    }

    /// Timed pop so callers can observe stop flags between attempts.
    /// Returns the entry's priority along with the task.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<(i64, DownloadTask)> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.heap.pop() {
            return Some((entry.priority, entry.task));
        }
        let (mut state, _) = self.available.wait_timeout(state, timeout).unwrap();
        state.heap.pop().map(|entry| (entry.priority, entry.task))
    }

    /// Acknowledge one consumed task.
    pub fn task_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until every queued task has been acknowledged.
    pub fn join(&self) {
        let mut state = self.state.lock().unwrap();
        while state.unfinished > 0 {
            state = self.idle.wait(state).unwrap();
        }
    }

    /// Throw away everything still queued, acknowledging each entry so
    /// `join` resolves. Tasks already popped stay with their workers.
    pub fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        let dropped = state.heap.len();
        state.heap.clear();
        state.unfinished = state.unfinished.saturating_sub(dropped);
        if state.unfinished == 0 {
            self.idle.notify_all();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().heap.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> TaskQueue {
        TaskQueue::new()
    }
}

/// Queue a download's tasks under the scheme's priority key: candidate
/// count for rarest-first, chunk id for in-order fetching.
pub fn build_task_queue(scheme: Scheme, tasks: Vec<DownloadTask>) -> TaskQueue {
    let queue = TaskQueue::new();
    for task in tasks {
        let priority = match scheme {
            Scheme::RarestFirst => task.candidates.len() as i64,
            Scheme::Normal => task.chunkid as i64,
        };
        queue.push(priority, task);
    }
    queue
}
