use crate::crypto::DepotKey;
use crate::error::{BadChunk, ChunkError};
use crate::fsutil::{with_suffix, FsRetry};
use crate::hash::{sha1_file, ChunkSha};
use crate::manifest::{FileEntry, Manifest};
use crate::path_safety::{ensure_dir_chain, validate_path, PathPolicy};
use crate::progress::ProgressLog;
use crate::session::{Observer, Session};
use crate::store::{open_source, process_chunk, ChunkSource, ChunkSourceConfig};
use anyhow::{anyhow, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const INCOMPLETE_SUFFIX: &str = ".incomplete";
pub const CORRUPTED_SUFFIX: &str = ".corrupted";

#[derive(Clone, Debug)]
pub struct ExtractConfig {
    /// Worker threads per file.
    pub threads: usize,
    /// Re-hash whole files against the manifest.
    pub validate: bool,
    /// Verify selected chunks without writing any output.
    pub dry_run: bool,
    /// Glob patterns over manifest paths; empty selects everything.
    pub filters: Vec<String>,
    pub source: ChunkSourceConfig,
    pub fs_retry: FsRetry,
    pub path_policy: PathPolicy,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            validate: false,
            dry_run: false,
            filters: Vec::new(),
            source: ChunkSourceConfig::default(),
            fs_retry: FsRetry::default(),
            path_policy: PathPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Written (or rewritten) in this run.
    Complete,
    /// Final file was already there (and matched, when validating).
    AlreadyPresent,
    /// Written, but the whole-file hash did not match; renamed to `.corrupted`.
    Corrupted,
    /// Some chunks failed; `.incomplete` and progress are kept for a later run.
    Incomplete,
    /// The output path is an existing directory.
    Blocked,
    DryRun,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileOutcome {
    pub path: String,
    pub state: FileState,
    pub chunks_total: usize,
    pub chunks_done: usize,
}

#[derive(Debug, Default)]
pub struct ExtractReport {
    pub directories: usize,
    pub files: Vec<FileOutcome>,
    pub bad_chunks: Vec<BadChunk>,
    pub interrupted: bool,
}

impl ExtractReport {
    pub fn count(&self, state: FileState) -> usize {
        self.files.iter().filter(|f| f.state == state).count()
    }

    pub fn success(&self) -> bool {
        !self.interrupted
            && self.bad_chunks.is_empty()
            && self.count(FileState::Corrupted) == 0
            && self.count(FileState::Incomplete) == 0
            && self.count(FileState::Blocked) == 0
    }
}

/// Min-heap of decoded chunks keyed by file offset. Completion order is arbitrary;
/// draining always writes in increasing offset order.
#[derive(Default)]
pub struct OrderedWriter {
    heap: BinaryHeap<Reverse<Slot>>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    offset: u64,
    sha: ChunkSha,
    data: Arc<Vec<u8>>,
}

impl OrderedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: u64, sha: ChunkSha, data: Arc<Vec<u8>>) {
        self.heap.push(Reverse(Slot { offset, sha, data }));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Write the lowest pending offset to `out`; returns what was written.
    pub fn write_next<W: Write + Seek>(&mut self, out: &mut W) -> Result<Option<(u64, ChunkSha)>> {
        let Some(Reverse(slot)) = self.heap.pop() else { return Ok(None) };
        out.seek(SeekFrom::Start(slot.offset))?;
        out.write_all(&slot.data)?;
        Ok(Some((slot.offset, slot.sha)))
    }
}

/// Where extraction state for one manifest lives.
pub fn progress_path(session: &Session, depot: u32, gid: u64) -> PathBuf {
    session.dest.join(depot.to_string()).join(format!("{gid}.progress.json"))
}

struct Extraction<'a> {
    session: &'a Session,
    source: Box<dyn ChunkSource>,
    key: Option<&'a DepotKey>,
    cfg: &'a ExtractConfig,
    observer: &'a dyn Observer,
    out_root: PathBuf,
    progress: Option<ProgressLog>,
    pool: rayon::ThreadPool,
    bad: Vec<BadChunk>,
    bad_seen: HashSet<ChunkSha>,
}

/// Materialize the selected files of `manifest` under `<dest>/<depot>/<gid>`.
pub fn extract_manifest(
    session: &Session,
    manifest: &Manifest,
    key: Option<&DepotKey>,
    cfg: &ExtractConfig,
    observer: &dyn Observer,
) -> Result<ExtractReport> {
    let manifest: Cow<'_, Manifest> = match (manifest.filenames_encrypted, key) {
        (false, _) => Cow::Borrowed(manifest),
        (true, Some(k)) => {
            let mut m = manifest.clone();
            m.decrypt_filenames(k)?;
            Cow::Owned(m)
        }
        (true, None) => {
            manifest.ensure_plain_names()?;
            Cow::Borrowed(manifest)
        }
    };
    let filter = build_filter(&cfg.filters)?;
    let selected = |fe: &FileEntry| filter.as_ref().map_or(true, |g| g.is_match(fe.rel_path()));

    let source = open_source(session, manifest.depot_id, &cfg.source)?;
    log::info!(
        "depot {} manifest {}: {} entries from {}",
        manifest.depot_id,
        manifest.gid,
        manifest.files.len(),
        source.describe()
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.threads.max(1))
        .build()
        .context("build worker pool")?;
    let progress = if cfg.dry_run {
        None
    } else {
        Some(ProgressLog::load(&progress_path(session, manifest.depot_id, manifest.gid))?)
    };
    let mut x = Extraction {
        session,
        source,
        key,
        cfg,
        observer,
        out_root: session.output_dir(manifest.depot_id, manifest.gid),
        progress,
        pool,
        bad: Vec::new(),
        bad_seen: HashSet::new(),
    };
    let mut report = ExtractReport::default();

    // 1) Directories up front, filters apply to files only
    if !cfg.dry_run {
        fs::create_dir_all(&x.out_root).with_context(|| format!("create {:?}", x.out_root))?;
        for fe in manifest.files.iter().filter(|fe| fe.is_directory()) {
            let dir = validate_path(&x.out_root, &fe.rel_path(), cfg.path_policy)?;
            ensure_dir_chain(&x.out_root, &dir)?;
            report.directories += 1;
        }
    }

    // 2) Files, one at a time
    for fe in manifest.files.iter().filter(|fe| !fe.is_directory() && selected(fe)) {
        if session.is_cancelled() {
            report.interrupted = true;
            break;
        }
        let outcome = if cfg.dry_run { x.check_file(fe)? } else { x.extract_file(fe)? };
        observer.file_finished(&outcome);
        report.files.push(outcome);
    }

    if let Some(p) = &x.progress {
        p.flush()?;
    }
    report.interrupted |= session.is_cancelled();
    report.bad_chunks = std::mem::take(&mut x.bad);
    log::info!(
        "manifest {}: {} complete, {} present, {} incomplete, {} corrupted, {} bad chunks",
        manifest.gid,
        report.count(FileState::Complete),
        report.count(FileState::AlreadyPresent),
        report.count(FileState::Incomplete),
        report.count(FileState::Corrupted),
        report.bad_chunks.len()
    );
    Ok(report)
}

fn build_filter(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        b.add(Glob::new(p).with_context(|| format!("bad filter {:?}", p))?);
    }
    Ok(Some(b.build()?))
}

/// Distinct hashes of a file with their declared lengths, in offset order.
fn distinct_chunks(fe: &FileEntry) -> Vec<(ChunkSha, u32)> {
    let mut seen = HashSet::new();
    fe.sorted_chunks()
        .into_iter()
        .filter(|c| seen.insert(c.sha))
        .map(|c| (c.sha, c.cb_original))
        .collect()
}

impl Extraction<'_> {
    fn progress(&self) -> Result<&ProgressLog> {
        self.progress.as_ref().ok_or_else(|| anyhow!("no progress log in dry run"))
    }

    /// Decode `work` on the pool. Chunks skipped for cancellation are absent.
    fn run_chunks(&self, work: &[(ChunkSha, u32)]) -> Vec<(ChunkSha, Result<Vec<u8>, ChunkError>)> {
        use rayon::prelude::*;
        let (source, key, session) = (self.source.as_ref(), self.key, self.session);
        self.pool.install(|| {
            work.par_iter()
                .filter(|_| !session.is_cancelled())
                .map(|(sha, len)| (*sha, process_chunk(source, key, sha, Some(*len))))
                .collect()
        })
    }

    fn record_bad(&mut self, sha: ChunkSha, err: ChunkError) {
        log::warn!("chunk {sha}: {err}");
        self.observer.chunk_failed(&sha, &err);
        if self.bad_seen.insert(sha) {
            self.bad.push(BadChunk { sha, reason: err });
        }
    }

    fn check_file(&mut self, fe: &FileEntry) -> Result<FileOutcome> {
        let work = distinct_chunks(fe);
        let mut done = 0;
        for (sha, r) in self.run_chunks(&work) {
            match r {
                Ok(_) => done += 1,
                Err(e) => self.record_bad(sha, e),
            }
        }
        Ok(FileOutcome {
            path: fe.filename.clone(),
            state: FileState::DryRun,
            chunks_total: work.len(),
            chunks_done: done,
        })
    }

    fn extract_file(&mut self, fe: &FileEntry) -> Result<FileOutcome> {
        let name = fe.filename.as_str();
        let out = validate_path(&self.out_root, &fe.rel_path(), self.cfg.path_policy)?;
        let work = distinct_chunks(fe);
        let total = work.len();
        let outcome = |state, done| FileOutcome { path: name.to_string(), state, chunks_total: total, chunks_done: done };

        // pending -> complete when the final file is already good
        if out.is_dir() {
            log::warn!("{}: output path is a directory, skipping", out.display());
            return Ok(outcome(FileState::Blocked, 0));
        }
        if out.is_file() {
            if !self.cfg.validate || self.matches(fe, &out)? {
                log::debug!("{name}: already present");
                return Ok(outcome(FileState::AlreadyPresent, total));
            }
            log::warn!("{name}: existing file fails validation, reprocessing");
        }

        // preparing
        if let Some(parent) = out.parent() {
            ensure_dir_chain(&self.out_root, parent)?;
        }
        let incomplete = with_suffix(&out, INCOMPLETE_SUFFIX);
        let resuming = incomplete.is_file();
        let mut file = self.cfg.fs_retry.preallocate(&incomplete, fe.size)?;
        let progress = self.progress()?;
        let done: HashSet<ChunkSha> = match progress.get(name)? {
            Some(rec) if resuming && rec.total_chunks == total => rec.processed_chunks.into_iter().collect(),
            rec => {
                if rec.is_some_and(|r| !r.processed_chunks.is_empty()) {
                    log::warn!("{name}: progress recorded without {}, starting over", incomplete.display());
                }
                progress.reset(name, total)?;
                HashSet::new()
            }
        };
        let pending: Vec<(ChunkSha, u32)> = work.iter().filter(|(s, _)| !done.contains(s)).copied().collect();
        log::info!("{name}: {} of {total} chunks to process", pending.len());

        // processing: decode everything, then write in offset order
        let mut offsets: HashMap<ChunkSha, Vec<u64>> = HashMap::new();
        for c in &fe.chunks {
            offsets.entry(c.sha).or_default().push(c.offset);
        }
        let mut writer = OrderedWriter::new();
        let mut remaining: BTreeMap<ChunkSha, usize> = BTreeMap::new();
        for (sha, r) in self.run_chunks(&pending) {
            match r {
                Ok(data) => {
                    let data = Arc::new(data);
                    let offs = offsets.get(&sha).map(Vec::as_slice).unwrap_or_default();
                    for &off in offs {
                        writer.push(off, sha, Arc::clone(&data));
                    }
                    remaining.insert(sha, offs.len());
                }
                Err(e) => self.record_bad(sha, e),
            }
        }
        let progress = self.progress()?;
        let mut marked = done.len();
        while let Some((_, sha)) = writer.write_next(&mut file)? {
            let Some(left) = remaining.get_mut(&sha) else { continue };
            *left -= 1;
            if *left == 0 {
                file.sync_data()?;
                progress.mark(name, sha)?;
                marked += 1;
            }
        }
        drop(file);

        if marked < total {
            progress.flush()?;
            let why = if self.session.is_cancelled() { "interrupted" } else { "missing chunks" };
            log::warn!("{name}: {marked}/{total} chunks ({why}), left as {}", incomplete.display());
            return Ok(outcome(FileState::Incomplete, marked));
        }

        // complete (or corrupted)
        self.cfg.fs_retry.run(&out, || fs::rename(&incomplete, &out))?;
        if self.cfg.validate && !self.matches(fe, &out)? {
            let bad = with_suffix(&out, CORRUPTED_SUFFIX);
            fs::rename(&out, &bad).with_context(|| format!("rename {:?}", out))?;
            log::error!("{name}: whole-file checksum mismatch, moved to {}", bad.display());
            return Ok(outcome(FileState::Corrupted, marked));
        }
        Ok(outcome(FileState::Complete, marked))
    }

    fn matches(&self, fe: &FileEntry, path: &Path) -> Result<bool> {
        match fe.sha_content {
            Some(expected) => Ok(sha1_file(path)? == expected),
            None => Ok(fe.size == fs::metadata(path)?.len()),
        }
    }
}
