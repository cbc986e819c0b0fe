use crate::error::ChunkError;
use crate::extract::FileOutcome;
use crate::hash::ChunkSha;
use crate::progress::TransferSnapshot;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Base paths and the cancellation flag, passed to every operation.
#[derive(Clone, Debug)]
pub struct Session {
    /// Archive root holding `depots/`, `keys/` and `depot_keys.txt`.
    pub root: PathBuf,
    /// Extraction root.
    pub dest: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl Session {
    pub fn new(root: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), dest: dest.into(), cancel: Arc::new(AtomicBool::new(false)) }
    }

    /// Share an externally owned flag (e.g. one set from a signal handler).
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn depot_dir(&self, depot: u32) -> PathBuf {
        self.root.join("depots").join(depot.to_string())
    }

    pub fn chunk_dir(&self, depot: u32) -> PathBuf {
        self.depot_dir(depot).join("chunk")
    }

    pub fn manifest_path(&self, depot: u32, gid: u64) -> PathBuf {
        crate::manifest::Manifest::cached_path(&self.root, depot, gid)
    }

    /// `<dest>/<depot>/<gid>`
    pub fn output_dir(&self, depot: u32, gid: u64) -> PathBuf {
        self.dest.join(depot.to_string()).join(gid.to_string())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Progress sink injected into long-running operations. All methods default to no-ops.
pub trait Observer: Sync {
    fn transfer(&self, _snap: &TransferSnapshot) {}
    fn chunk_failed(&self, _sha: &ChunkSha, _err: &ChunkError) {}
    fn chunk_packed(&self, _depot: u32, _sha: &ChunkSha, _done: usize, _total: usize) {}
    fn file_finished(&self, _outcome: &FileOutcome) {}
}

pub struct NoopObserver;

impl Observer for NoopObserver {}
