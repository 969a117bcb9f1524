//! An asynchronous sidecar-file writer. Jobs are serialized per user key
//! so the last put for a key always owns the on-disk file, while
//! different keys proceed in parallel on a small worker pool.

use crossbeam::channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::Result;

const WORKERS: usize = 2;

/// A unit of sidecar I/O.
#[derive(Clone)]
pub enum Job {
    Write { path: PathBuf, bytes: Arc<Vec<u8>> },
    Remove { path: PathBuf },
}

impl Job {
    fn run(&self) {
        if let Err(error) = self.execute() {
            match self {
                Job::Write { path, .. } => {
                    log::error!("failed to write sidecar {}: {error}", path.display())
                }
                Job::Remove { path } => {
                    log::error!("failed to remove sidecar {}: {error}", path.display())
                }
            }
        }
    }

    fn execute(&self) -> std::io::Result<()> {
        match self {
            Job::Write { path, bytes } => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                let mut file = fs::File::create(path)?;
                file.write_all(bytes)?;
                file.sync_all()
            }
            Job::Remove { path } => match fs::remove_file(path) {
                Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
                _ => Ok(()),
            },
        }
    }
}

struct Slots {
    map: Mutex<HashMap<String, VecDeque<Job>>>,
    idle: Condvar,
}

/// The writer pool. A key is handed to a worker only when its queue goes
/// from empty to non-empty; that worker then drains the queue, so jobs
/// for one key never interleave across workers.
pub struct BlobWriter {
    slots: Arc<Slots>,
    tx: Option<Sender<String>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl BlobWriter {
    pub fn new() -> Result<Self> {
        let slots = Arc::new(Slots { map: Mutex::new(HashMap::new()), idle: Condvar::new() });
        let (tx, rx) = crossbeam::channel::unbounded::<String>();
        let mut workers = Vec::with_capacity(WORKERS);
        for i in 0..WORKERS {
            let rx = rx.clone();
            let slots = Arc::clone(&slots);
            let handle = thread::Builder::new()
                .name(format!("kvlite-blob-{i}"))
                .spawn(move || Self::run(rx, slots))?;
            workers.push(handle);
        }
        Ok(Self { slots, tx: Some(tx), workers })
    }

    fn run(rx: Receiver<String>, slots: Arc<Slots>) {
        while let Ok(key) = rx.recv() {
            loop {
                let job = {
                    let map = slots.map.lock().unwrap();
                    map.get(&key).and_then(|queue| queue.front().cloned())
                };
                let Some(job) = job else { break };
                job.run();

                let mut map = slots.map.lock().unwrap();
                let Some(queue) = map.get_mut(&key) else { break };
                queue.pop_front();
                if queue.is_empty() {
                    map.remove(&key);
                    if map.is_empty() {
                        slots.idle.notify_all();
                    }
                    break;
                }
            }
        }
    }

    /// Enqueues a job under the given key's serialization tag.
    pub fn submit(&self, key: &str, job: Job) {
        let fresh = {
            let mut map = self.slots.map.lock().unwrap();
            let queue = map.entry(key.to_string()).or_default();
            queue.push_back(job);
            queue.len() == 1
        };
        if fresh {
            if let Some(tx) = &self.tx {
                let _ = tx.send(key.to_string());
            }
        }
    }

    /// The bytes of the most recent pending write for `key`, if any. Used
    /// by the read path while the sidecar has not landed yet.
    pub fn pending_write(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let map = self.slots.map.lock().unwrap();
        map.get(key)?.iter().rev().find_map(|job| match job {
            Job::Write { bytes, .. } => Some(Arc::clone(bytes)),
            Job::Remove { .. } => None,
        })
    }

    /// Blocks until all pending jobs have completed.
    pub fn wait_idle(&self) {
        let mut map = self.slots.map.lock().unwrap();
        while !map.is_empty() {
            map = self.slots.idle.wait(map).unwrap();
        }
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        self.wait_idle();
        self.tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
