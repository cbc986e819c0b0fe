use crate::hash::ChunkSha;
use crate::session::Observer;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Shared download counters, updated by workers and sampled by the monitor.
#[derive(Default, Debug)]
pub struct TransferCounters {
    pub downloaded: AtomicUsize,
    pub skipped: AtomicUsize,
    pub bytes: AtomicU64,
}

impl TransferCounters {
    pub fn processed(&self) -> usize {
        self.downloaded.load(Ordering::Relaxed) + self.skipped.load(Ordering::Relaxed)
    }
    pub fn add_download(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.downloaded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransferSnapshot {
    /// Moving average over the sample window.
    pub bytes_per_sec: f64,
    pub processed: usize,
    pub total: usize,
    pub elapsed: Duration,
}

/// Sliding window of per-interval byte counts.
#[derive(Debug)]
pub struct ThroughputWindow {
    samples: VecDeque<u64>,
    cap: usize,
}

impl ThroughputWindow {
    pub fn new(cap: usize) -> Self {
        Self { samples: VecDeque::with_capacity(cap), cap: cap.max(1) }
    }

    /// Push one interval's byte count and return the mean per interval.
    pub fn push(&mut self, bytes: u64) -> f64 {
        self.samples.push_back(bytes);
        while self.samples.len() > self.cap {
            self.samples.pop_front();
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }
}

/// Sample `counters` every `interval` until all `total` chunks are accounted for
/// or `stop` is raised. Runs on the caller's thread.
pub fn run_monitor(
    counters: &TransferCounters,
    total: usize,
    interval: Duration,
    window: usize,
    stop: &AtomicBool,
    observer: &dyn Observer,
) {
    let t0 = Instant::now();
    let mut win = ThroughputWindow::new(window);
    let mut last_bytes = 0u64;
    loop {
        let cum = counters.bytes.load(Ordering::Relaxed);
        let per_interval = win.push(cum - last_bytes);
        last_bytes = cum;
        let processed = counters.processed();
        observer.transfer(&TransferSnapshot {
            bytes_per_sec: per_interval / interval.as_secs_f64().max(f64::EPSILON),
            processed,
            total,
            elapsed: t0.elapsed(),
        });
        if processed >= total || stop.load(Ordering::Relaxed) {
            break;
        }
        // sleep in slices so completion is noticed promptly
        let wake = Instant::now() + interval;
        while Instant::now() < wake {
            if stop.load(Ordering::Relaxed) || counters.processed() >= total {
                break;
            }
            thread::sleep(interval.min(Duration::from_millis(50)));
        }
    }
}

/// Per output file resume record.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FileProgress {
    pub total_chunks: usize,
    pub processed_chunks: BTreeSet<ChunkSha>,
}

impl FileProgress {
    pub fn is_complete(&self) -> bool {
        self.processed_chunks.len() >= self.total_chunks
    }
}

/// Extraction progress side file (`filename -> FileProgress`), rewritten after
/// every chunk. Updates are serialized by the inner mutex.
#[derive(Debug)]
pub struct ProgressLog {
    path: PathBuf,
    files: Mutex<BTreeMap<String, FileProgress>>,
}

impl ProgressLog {
    pub fn load(path: &Path) -> Result<Self> {
        let files = if path.exists() {
            let f = File::open(path).with_context(|| format!("open {:?}", path))?;
            serde_json::from_reader(std::io::BufReader::new(f))
                .with_context(|| format!("parse progress {:?}", path))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), files: Mutex::new(files) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, FileProgress>>> {
        self.files.lock().map_err(|_| anyhow!("progress log lock poisoned"))
    }

    pub fn get(&self, name: &str) -> Result<Option<FileProgress>> {
        Ok(self.lock()?.get(name).cloned())
    }

    /// Start (or restart) a file with an empty processed set.
    pub fn reset(&self, name: &str, total_chunks: usize) -> Result<()> {
        let mut g = self.lock()?;
        g.insert(name.to_string(), FileProgress { total_chunks, processed_chunks: BTreeSet::new() });
        Self::persist_locked(&self.path, &g)
    }

    /// Record one chunk as durable and persist immediately.
    pub fn mark(&self, name: &str, sha: ChunkSha) -> Result<()> {
        let mut g = self.lock()?;
        g.entry(name.to_string()).or_default().processed_chunks.insert(sha);
        Self::persist_locked(&self.path, &g)
    }

    pub fn flush(&self) -> Result<()> {
        let g = self.lock()?;
        Self::persist_locked(&self.path, &g)
    }

    fn persist_locked(path: &Path, files: &BTreeMap<String, FileProgress>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        serde_json::to_writer_pretty(File::create(&tmp)?, files)?;
        fs::rename(&tmp, path).with_context(|| format!("persist {:?}", path))
    }
}
