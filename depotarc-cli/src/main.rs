use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use depotarc_core::backup::{restore, SkuDescriptor};
use depotarc_core::chunkstore::{IndexDump, StorePaths};
use depotarc_core::crypto::{find_depot_key, DepotKey};
use depotarc_core::download::{download_manifest, Endpoints, HttpFetcher, ServerList, TransferConfig};
use depotarc_core::error::{BadChunk, ChunkError};
use depotarc_core::extract::{extract_manifest, ExtractConfig, FileOutcome, FileState};
use depotarc_core::hash::ChunkSha;
use depotarc_core::manifest::Manifest;
use depotarc_core::pack::{pack_depot, unpack_chunkstore, PackOptions, UnpackKey};
use depotarc_core::progress::TransferSnapshot;
use depotarc_core::session::{Observer, Session};
use depotarc_core::store::ChunkSourceConfig;
use depotarc_core::validate::validate_source;

mod signal;

const EXIT_FAILED: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "depotarc", version, about = "Archive, pack and extract depot chunks")]
struct Cli {
    /// Archive root holding depots/, keys/ and depot_keys.txt
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// More log output (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Download every chunk of a cached manifest
    Download {
        depot: u32,
        gid: u64,
        /// JSON list of {host, port, https} servers, rotated on failure
        #[arg(long, conflicts_with = "server", required_unless_present = "server")]
        servers: Option<PathBuf>,
        /// Fixed base URL, never rotated
        #[arg(long)]
        server: Option<String>,
        /// Manifest JSON to use instead of the cached copy
        #[arg(long)]
        manifest: Option<PathBuf>,
        #[arg(short = 'c', long, default_value_t = 10)]
        concurrency: usize,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Pack loose chunks into chunkstores (and sku.json with -a)
    Pack {
        /// depot[:manifest], repeatable
        #[arg(short = 'd', long = "depot", required = true)]
        depots: Vec<String>,
        #[arg(long, default_value = ".")]
        destdir: PathBuf,
        /// Pack `_decrypted` chunks into plaintext stores
        #[arg(long)]
        decrypted: bool,
        /// Replace existing stores instead of appending
        #[arg(long)]
        no_update: bool,
        /// App id; writes sku.json when every depot has a manifest
        #[arg(short = 'a', long)]
        app: Option<u32>,
        #[arg(short = 'n', long, default_value = "depotarc backup")]
        name: String,
    },
    /// Unpack a chunkstore (.csm/.csd) or a whole backup (sku.json)
    Unpack {
        target: PathBuf,
        /// Re-encrypt every chunk with a fresh IV
        #[arg(short = 'e', long, conflicts_with = "decrypt")]
        reencrypt: bool,
        /// Write encrypted chunks decrypted
        #[arg(long)]
        decrypt: bool,
        /// Depot key as hex (single chunkstore only)
        #[arg(long)]
        key: Option<String>,
    },
    /// Extract a cached manifest's files
    Extract {
        depot: u32,
        gid: u64,
        /// Depot key as hex
        key: Option<String>,
        /// Only extract matching paths, repeatable
        #[arg(short = 'f', long = "filter")]
        filters: Vec<String>,
        /// Read chunks from this chunkstore set instead of loose files
        #[arg(short = 'b', long)]
        chunkstore: Option<PathBuf>,
        #[arg(long, default_value = "extract")]
        dest: PathBuf,
        /// Re-hash whole files
        #[arg(long)]
        validate: bool,
        #[arg(long, default_value_t = 4)]
        max_threads: usize,
        /// Verify chunks without writing files
        #[arg(long)]
        dry_run: bool,
    },
    /// Decrypt, decompress and hash-check every stored chunk of a depot
    VerifyChunks {
        depot: u32,
        key: Option<String>,
        #[arg(short = 'b', long)]
        chunkstore: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
    /// Write <name>.json beside every .csm in a directory
    DumpIndex { dir: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    let cancel = signal::install();
    let code = match run(cli, cancel) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_FAILED
        }
    };
    let code = if code != 0 && signal::interrupted() { EXIT_INTERRUPTED } else { code };
    std::process::exit(code)
}

fn run(cli: Cli, cancel: Arc<AtomicBool>) -> Result<i32> {
    let session = |dest: PathBuf| Session::new(cli.root.clone(), dest).with_cancel_flag(Arc::clone(&cancel));
    match cli.cmd {
        Cmd::Download { depot, gid, servers, server, manifest, concurrency, timeout_secs } => {
            let s = session(PathBuf::from("."));
            let endpoints = match (servers, server) {
                (_, Some(url)) => Endpoints::Override(url),
                (Some(list), None) => Endpoints::Rotating(ServerList::load(&list)?),
                (None, None) => bail!("either --servers or --server is required"),
            };
            let manifest = load_manifest(&s, depot, gid, manifest.as_deref())?;
            let cfg = TransferConfig { concurrency, ..Default::default() };
            let console = Console::default();
            let fetcher = HttpFetcher::new(Duration::from_secs(timeout_secs));
            let sum = download_manifest(&s, &manifest, &endpoints, &cfg, &fetcher, &console)?;
            console.end_line();
            eprintln!(
                "{} chunks: {} downloaded, {} skipped, {:.2} MiB",
                sum.total,
                sum.downloaded,
                sum.skipped,
                sum.bytes as f64 / (1 << 20) as f64
            );
            if let Some(f) = &sum.fatal {
                eprintln!("aborted: {f}");
            }
            Ok(if sum.success() { 0 } else { EXIT_FAILED })
        }
        Cmd::Pack { depots, destdir, decrypted, no_update, app, name } => {
            let s = session(PathBuf::from("."));
            let specs = depots.iter().map(|d| parse_depot_spec(d)).collect::<Result<Vec<_>>>()?;
            let opts = PackOptions { decrypted, overwrite: no_update };
            let mut sku = app.map(|a| SkuDescriptor::new(name.clone(), Some(a), !decrypted));
            let console = Console::default();
            for (depot, gid) in specs {
                let dest = StorePaths::in_dir(&destdir, depot, 1);
                let r = pack_depot(&s, depot, &dest, &opts, &console)?;
                console.end_line();
                eprintln!("depot {depot}: {} added, {} already packed, {} bytes", r.added, r.skipped, r.bytes_total);
                match (gid, sku.as_mut()) {
                    (Some(gid), Some(d)) => d.add_store(depot, gid, 1, r.bytes_total),
                    (None, Some(_)) => {
                        eprintln!("not writing sku.json: no manifest given for depot {depot}");
                        sku = None;
                    }
                    _ => {}
                }
            }
            if let Some(d) = sku {
                let p = d.write(&destdir)?;
                eprintln!("wrote {}", p.display());
            }
            Ok(0)
        }
        Cmd::Unpack { target, reencrypt, decrypt, key } => {
            let s = session(PathBuf::from("."));
            let console = Console::default();
            let unpack_key = |depot: u32| -> Result<UnpackKey> {
                if !reencrypt && !decrypt {
                    return Ok(UnpackKey::Verbatim);
                }
                let k = resolve_key(&s, depot, key.as_deref())?
                    .ok_or_else(|| anyhow!("no depot key for depot {depot}"))?;
                Ok(if reencrypt { UnpackKey::Reencrypt(k) } else { UnpackKey::Decrypt(k) })
            };
            if target.extension().is_some_and(|e| e == "json") {
                let desc = SkuDescriptor::load(&target)?;
                let dir = target.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
                let r = restore(&s, &desc, &dir, &unpack_key, &console)?;
                console.end_line();
                println!("to extract, run these manifests:");
                for (depot, gid) in &r.manifests {
                    println!("depot {depot} manifest {gid}");
                }
            } else {
                let depot = depotarc_core::chunkstore::read_index(&StorePaths::from_any(&target).csm)?.0.depot;
                let r = unpack_chunkstore(&s, &target, &unpack_key(depot)?, &console)?;
                console.end_line();
                eprintln!("depot {}: {} written, {} already present", r.depot, r.written, r.skipped);
            }
            Ok(if s.is_cancelled() { EXIT_INTERRUPTED } else { 0 })
        }
        Cmd::Extract { depot, gid, key, filters, chunkstore, dest, validate, max_threads, dry_run } => {
            let s = session(dest);
            let key = resolve_key(&s, depot, key.as_deref())?;
            let manifest = load_manifest(&s, depot, gid, None)?;
            if let Some(t) = manifest.created() {
                log::info!("manifest {gid} created {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            let cfg = ExtractConfig {
                threads: max_threads,
                validate,
                dry_run,
                filters,
                source: source_config(chunkstore),
                ..Default::default()
            };
            let console = Console::default();
            let r = extract_manifest(&s, &manifest, key.as_ref(), &cfg, &console)?;
            eprintln!(
                "{} directories, {} extracted, {} already present, {} incomplete, {} corrupted, {} blocked",
                r.directories,
                r.count(FileState::Complete) + r.count(FileState::DryRun),
                r.count(FileState::AlreadyPresent),
                r.count(FileState::Incomplete),
                r.count(FileState::Corrupted),
                r.count(FileState::Blocked)
            );
            print_bad(&r.bad_chunks);
            for f in &r.files {
                match f.state {
                    FileState::Corrupted => println!("corrupted: {}", f.path),
                    FileState::Blocked => println!("blocked: {}", f.path),
                    _ => {}
                }
            }
            Ok(if r.interrupted { EXIT_INTERRUPTED } else if r.success() { 0 } else { EXIT_FAILED })
        }
        Cmd::VerifyChunks { depot, key, chunkstore, threads } => {
            let s = session(PathBuf::from("."));
            let key = resolve_key(&s, depot, key.as_deref())?;
            let r = validate_source(&s, depot, key.as_ref(), &source_config(chunkstore), threads, &Console::default())?;
            eprintln!("{} chunks: {} ok, {} bad", r.total, r.ok, r.bad.len());
            print_bad(&r.bad);
            Ok(if s.is_cancelled() { EXIT_INTERRUPTED } else if r.bad.is_empty() { 0 } else { EXIT_FAILED })
        }
        Cmd::DumpIndex { dir } => {
            for p in IndexDump::write_all(&dir)? {
                eprintln!("wrote {}", p.display());
            }
            Ok(0)
        }
    }
}

/// `depot` or `depot:manifest`.
fn parse_depot_spec(s: &str) -> Result<(u32, Option<u64>)> {
    let (d, m) = match s.split_once(':') {
        Some((d, m)) => (d, Some(m)),
        None => (s, None),
    };
    let depot = d.trim().parse().with_context(|| format!("bad depot id {:?}", d))?;
    let gid = m.map(|m| m.trim().parse().with_context(|| format!("bad manifest id {:?}", m))).transpose()?;
    Ok((depot, gid))
}

fn resolve_key(s: &Session, depot: u32, explicit: Option<&str>) -> Result<Option<DepotKey>> {
    match explicit {
        Some(hex) => DepotKey::from_hex(hex).map(Some),
        None => find_depot_key(s.root(), depot),
    }
}

fn load_manifest(s: &Session, depot: u32, gid: u64, path: Option<&Path>) -> Result<Manifest> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| s.manifest_path(depot, gid));
    let m = Manifest::load(&path)?;
    if m.depot_id != depot || m.gid != gid {
        bail!("{} holds depot {} manifest {}, expected {depot} {gid}", path.display(), m.depot_id, m.gid);
    }
    Ok(m)
}

fn source_config(chunkstore: Option<PathBuf>) -> ChunkSourceConfig {
    chunkstore.map_or(ChunkSourceConfig::Loose, ChunkSourceConfig::Chunkstores)
}

fn print_bad(bad: &[BadChunk]) {
    if bad.is_empty() {
        return;
    }
    eprintln!("{} bad chunks:", bad.len());
    for b in bad {
        println!("{}\t{}", b.sha, b.reason);
    }
}

/// Prints progress on stderr, redrawing one status line.
#[derive(Default)]
struct Console {
    line_open: AtomicBool,
}

impl Console {
    fn status(&self, line: &str) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{line}");
        let _ = err.flush();
        self.line_open.store(true, Ordering::Relaxed);
    }

    fn end_line(&self) {
        if self.line_open.swap(false, Ordering::Relaxed) {
            eprintln!();
        }
    }
}

impl Observer for Console {
    fn transfer(&self, snap: &TransferSnapshot) {
        self.status(&format!(
            "Downloading at {:.2} MB/s ({}/{})",
            snap.bytes_per_sec / 1_000_000.0,
            snap.processed,
            snap.total
        ));
    }

    fn chunk_failed(&self, sha: &ChunkSha, err: &ChunkError) {
        self.end_line();
        eprintln!("chunk {sha}: {err}");
    }

    fn chunk_packed(&self, depot: u32, _sha: &ChunkSha, done: usize, total: usize) {
        if done == total || done % 64 == 0 {
            self.status(&format!("depot {depot}: chunk {done}/{total}"));
        }
    }

    fn file_finished(&self, f: &FileOutcome) {
        let what = match f.state {
            FileState::Complete => "extracted",
            FileState::AlreadyPresent => return,
            FileState::Corrupted => "CORRUPTED",
            FileState::Incomplete => "incomplete",
            FileState::Blocked => "blocked by directory",
            FileState::DryRun => "checked",
        };
        self.end_line();
        eprintln!("{what}: {} ({}/{} chunks)", f.path, f.chunks_done, f.chunks_total);
    }
}
