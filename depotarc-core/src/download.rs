use crate::error::FetchError;
use crate::hash::ChunkSha;
use crate::manifest::Manifest;
use crate::progress::{run_monitor, TransferCounters};
use crate::session::{Observer, Session};
use crate::store::{ChunkSource, LooseChunks};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnServer {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_https")]
    pub https: bool,
}

fn default_port() -> u16 {
    443
}

fn default_https() -> bool {
    true
}

impl CdnServer {
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Ordered server list shared by all workers. Rotation is a relaxed counter;
/// two workers may both step past the same bad server.
#[derive(Debug)]
pub struct ServerList {
    servers: Vec<CdnServer>,
    cursor: AtomicUsize,
}

impl ServerList {
    pub fn new(servers: Vec<CdnServer>) -> Result<Self> {
        if servers.is_empty() {
            bail!("server list is empty");
        }
        Ok(Self { servers, cursor: AtomicUsize::new(0) })
    }

    /// Load a JSON array of `{host, port, https}` objects.
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let servers: Vec<CdnServer> =
            serde_json::from_reader(std::io::BufReader::new(f)).with_context(|| format!("parse {:?}", path))?;
        Self::new(servers)
    }

    pub fn current(&self) -> &CdnServer {
        &self.servers[self.cursor.load(Ordering::Relaxed) % self.servers.len()]
    }

    pub fn rotate(&self) -> &CdnServer {
        let next = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        &self.servers[next % self.servers.len()]
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[derive(Debug)]
pub enum Endpoints {
    Rotating(ServerList),
    /// One fixed base URL; never rotated.
    Override(String),
}

impl Endpoints {
    pub fn base(&self) -> String {
        match self {
            Endpoints::Rotating(list) => list.current().base_url(),
            Endpoints::Override(url) => url.trim_end_matches('/').to_string(),
        }
    }

    pub fn rotate(&self) {
        if let Endpoints::Rotating(list) = self {
            let next = list.rotate();
            log::debug!("rotated to {}", next.base_url());
        }
    }
}

pub fn chunk_url(base: &str, depot: u32, sha: &ChunkSha) -> String {
    format!("{}/depot/{depot}/chunk/{}", base.trim_end_matches('/'), sha.to_hex())
}

/// Fetches one chunk's encrypted bytes from one server.
pub trait ChunkFetcher: Sync {
    fn fetch(&self, base: &str, depot: u32, sha: &ChunkSha) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ChunkFetcher for HttpFetcher {
    fn fetch(&self, base: &str, depot: u32, sha: &ChunkSha) -> Result<Vec<u8>, FetchError> {
        let url = chunk_url(base, depot, sha);
        match self.agent.get(&url).call() {
            Ok(resp) => {
                let mut body = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut body)
                    .map_err(|e| FetchError::Transient(format!("read body: {e}")))?;
                Ok(body)
            }
            Err(ureq::Error::Status(code, _)) => Err(FetchError::from_status(code)),
            Err(ureq::Error::Transport(t)) => Err(FetchError::Transient(t.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub concurrency: usize,
    pub retry_delay: Duration,
    pub sample_interval: Duration,
    pub window: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            retry_delay: Duration::from_millis(500),
            sample_interval: Duration::from_secs(1),
            window: 6,
        }
    }
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub total: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes: u64,
    /// Set when a client-error status aborted the run.
    pub fatal: Option<FetchError>,
    pub interrupted: bool,
}

impl DownloadSummary {
    pub fn success(&self) -> bool {
        self.fatal.is_none() && !self.interrupted
    }
}

struct Transfer<'a> {
    session: &'a Session,
    depot: u32,
    store: LooseChunks,
    endpoints: &'a Endpoints,
    cfg: &'a TransferConfig,
    fetcher: &'a dyn ChunkFetcher,
    counters: TransferCounters,
    abort: AtomicBool,
    fatal: Mutex<Option<FetchError>>,
}

impl Transfer<'_> {
    fn halted(&self) -> bool {
        self.abort.load(Ordering::Relaxed) || self.session.is_cancelled()
    }

    fn run_shard(&self, part: &[ChunkSha]) -> Result<()> {
        for sha in part {
            if self.halted() {
                return Ok(());
            }
            if self.store.has(sha) {
                log::debug!("{sha}: already present");
                self.counters.add_skip();
                continue;
            }
            loop {
                if self.halted() {
                    return Ok(());
                }
                let base = self.endpoints.base();
                match self.fetcher.fetch(&base, self.depot, sha) {
                    Ok(bytes) => {
                        self.store.put(sha, &bytes, true)?;
                        self.counters.add_download(bytes.len());
                        break;
                    }
                    Err(FetchError::Fatal { status }) => {
                        log::error!("{}: status {status}, aborting", chunk_url(&base, self.depot, sha));
                        if let Ok(mut g) = self.fatal.lock() {
                            g.get_or_insert(FetchError::Fatal { status });
                        }
                        self.abort.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                    Err(FetchError::Transient(reason)) => {
                        log::warn!("{base}: {reason}; rotating server");
                        self.endpoints.rotate();
                        thread::sleep(self.cfg.retry_delay);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Materialize every chunk in `shas` into the depot's loose chunk directory.
/// Chunks already present are skipped. `shas` is split into contiguous shards,
/// one worker thread each, plus one monitor thread reporting throughput.
pub fn download_chunks(
    session: &Session,
    depot: u32,
    shas: &[ChunkSha],
    endpoints: &Endpoints,
    cfg: &TransferConfig,
    fetcher: &dyn ChunkFetcher,
    observer: &dyn Observer,
) -> Result<DownloadSummary> {
    let store = LooseChunks::new(session.chunk_dir(depot));
    fs::create_dir_all(store.dir()).with_context(|| format!("create {:?}", store.dir()))?;
    let t = Transfer {
        session,
        depot,
        store,
        endpoints,
        cfg,
        fetcher,
        counters: TransferCounters::default(),
        abort: AtomicBool::new(false),
        fatal: Mutex::new(None),
    };
    let workers = cfg.concurrency.clamp(1, shas.len().max(1));
    let shard = shas.len().div_ceil(workers).max(1);
    log::info!("depot {depot}: {} chunks over {workers} workers from {}", shas.len(), endpoints.base());

    let stop = AtomicBool::new(false);
    let tr = &t;
    let stop_ref = &stop;
    thread::scope(|s| -> Result<()> {
        let monitor = s.spawn(move || {
            run_monitor(&tr.counters, shas.len(), cfg.sample_interval, cfg.window, stop_ref, observer)
        });
        let handles: Vec<_> = shas.chunks(shard).map(|part| s.spawn(move || tr.run_shard(part))).collect();
        let mut first_err = None;
        for h in handles {
            let r = h.join().map_err(|_| anyhow!("download worker panicked")).and_then(|r| r);
            if let Err(e) = r {
                tr.abort.store(true, Ordering::SeqCst);
                first_err.get_or_insert(e);
            }
        }
        stop_ref.store(true, Ordering::SeqCst);
        monitor.join().map_err(|_| anyhow!("monitor thread panicked"))?;
        first_err.map_or(Ok(()), Err)
    })?;

    let summary = DownloadSummary {
        total: shas.len(),
        downloaded: t.counters.downloaded.load(Ordering::Relaxed),
        skipped: t.counters.skipped.load(Ordering::Relaxed),
        bytes: t.counters.bytes.load(Ordering::Relaxed),
        fatal: t.fatal.into_inner().map_err(|_| anyhow!("fatal slot poisoned"))?,
        interrupted: session.is_cancelled(),
    };
    log::info!(
        "depot {depot}: {} downloaded, {} skipped, {} bytes",
        summary.downloaded,
        summary.skipped,
        summary.bytes
    );
    Ok(summary)
}

/// Cache the manifest under the archive root and download all of its chunks.
pub fn download_manifest(
    session: &Session,
    manifest: &Manifest,
    endpoints: &Endpoints,
    cfg: &TransferConfig,
    fetcher: &dyn ChunkFetcher,
    observer: &dyn Observer,
) -> Result<DownloadSummary> {
    let cached = session.manifest_path(manifest.depot_id, manifest.gid);
    if !cached.exists() {
        manifest.save(&cached)?;
    }
    let shas = manifest.unique_chunks();
    download_chunks(session, manifest.depot_id, &shas, endpoints, cfg, fetcher, observer)
}
