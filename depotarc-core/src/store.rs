use crate::chunkstore::{Chunkstore, StorePaths};
use crate::crypto::{symmetric_decrypt, DepotKey};
use crate::error::ChunkError;
use crate::hash::ChunkSha;
use crate::session::Session;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix marking a loose chunk whose payload is already decrypted.
pub const DECRYPTED_SUFFIX: &str = "_decrypted";

/// Raw stored bytes for one chunk.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub encrypted: bool,
}

/// Read access to stored chunk payloads, keyed by content address.
pub trait ChunkSource: Send + Sync {
    fn get(&self, sha: &ChunkSha) -> Result<Option<Payload>, ChunkError>;
    fn has(&self, sha: &ChunkSha) -> bool;
    /// Every address the source holds.
    fn list(&self) -> Result<Vec<ChunkSha>>;
    fn describe(&self) -> String;
}

/// Per-depot directory of loose chunk files: `<hex>` (encrypted) or `<hex>_decrypted`.
#[derive(Clone, Debug)]
pub struct LooseChunks {
    dir: PathBuf,
}

impl LooseChunks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sha: &ChunkSha, encrypted: bool) -> PathBuf {
        let hex = sha.to_hex();
        if encrypted {
            self.dir.join(hex)
        } else {
            self.dir.join(hex + DECRYPTED_SUFFIX)
        }
    }

    /// Store one payload; the write is atomic.
    pub fn put(&self, sha: &ChunkSha, bytes: &[u8], encrypted: bool) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).with_context(|| format!("create {:?}", self.dir))?;
        let path = self.path_for(sha, encrypted);
        crate::fsutil::write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Parse a loose chunk file name into its address and encryption state.
    pub fn parse_name(name: &str) -> Option<(ChunkSha, bool)> {
        let (hex, encrypted) = match name.strip_suffix(DECRYPTED_SUFFIX) {
            Some(h) => (h, false),
            None => (name, true),
        };
        if hex.len() != ChunkSha::LEN * 2 {
            return None;
        }
        hex.parse().ok().map(|sha| (sha, encrypted))
    }

    /// All loose chunk files as `(sha, encrypted, path)`, sorted by address.
    pub fn scan(&self) -> Result<Vec<(ChunkSha, bool, PathBuf)>> {
        let mut out = Vec::new();
        if !self.dir.is_dir() {
            return Ok(out);
        }
        for ent in fs::read_dir(&self.dir).with_context(|| format!("read dir {:?}", self.dir))? {
            let ent = ent?;
            if !ent.file_type()?.is_file() {
                continue;
            }
            let name = ent.file_name();
            let Some((sha, enc)) = name.to_str().and_then(Self::parse_name) else { continue };
            out.push((sha, enc, ent.path()));
        }
        out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(out)
    }
}

impl ChunkSource for LooseChunks {
    fn get(&self, sha: &ChunkSha) -> Result<Option<Payload>, ChunkError> {
        // a plaintext copy saves the decrypt step
        for encrypted in [false, true] {
            match fs::read(self.path_for(sha, encrypted)) {
                Ok(bytes) => return Ok(Some(Payload { bytes, encrypted })),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn has(&self, sha: &ChunkSha) -> bool {
        self.path_for(sha, false).is_file() || self.path_for(sha, true).is_file()
    }

    fn list(&self) -> Result<Vec<ChunkSha>> {
        let mut v: Vec<ChunkSha> = self.scan()?.into_iter().map(|(s, _, _)| s).collect();
        v.dedup();
        Ok(v)
    }

    fn describe(&self) -> String {
        format!("loose chunks in {}", self.dir.display())
    }
}

/// A numbered run of chunkstores (`X_1`, `X_2`, ...) read as one source.
pub struct ChunkstoreSet {
    stores: Vec<Chunkstore>,
    by_sha: HashMap<ChunkSha, usize>,
}

impl ChunkstoreSet {
    /// Open `first` and every numbered sibling next to it.
    pub fn open(first: &Path) -> Result<Self> {
        let paths = StorePaths::siblings(first)?;
        if paths.is_empty() {
            bail!("no chunkstore found at {:?}", first);
        }
        let stores = paths.iter().map(|p| Chunkstore::open(&p.csm)).collect::<Result<Vec<_>>>()?;
        Ok(Self::from_stores(stores))
    }

    pub fn from_stores(stores: Vec<Chunkstore>) -> Self {
        let mut by_sha = HashMap::new();
        for (i, s) in stores.iter().enumerate() {
            log::info!("{}: {} chunks", s.paths.csm.display(), s.entries().len());
            for e in s.entries() {
                by_sha.entry(e.sha).or_insert(i);
            }
        }
        Self { stores, by_sha }
    }

    pub fn stores(&self) -> &[Chunkstore] {
        &self.stores
    }
}

impl ChunkSource for ChunkstoreSet {
    fn get(&self, sha: &ChunkSha) -> Result<Option<Payload>, ChunkError> {
        let Some(&i) = self.by_sha.get(sha) else { return Ok(None) };
        let store = &self.stores[i];
        Ok(store.get(sha).map(|b| Payload { bytes: b.to_vec(), encrypted: store.is_encrypted() }))
    }

    fn has(&self, sha: &ChunkSha) -> bool {
        self.by_sha.contains_key(sha)
    }

    fn list(&self) -> Result<Vec<ChunkSha>> {
        let mut v: Vec<ChunkSha> = self.by_sha.keys().copied().collect();
        v.sort();
        Ok(v)
    }

    fn describe(&self) -> String {
        match self.stores.first() {
            Some(s) => format!("{} chunkstore(s) starting at {}", self.stores.len(), s.paths.csm.display()),
            None => "empty chunkstore set".into(),
        }
    }
}

/// Where extraction and validation read chunks from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ChunkSourceConfig {
    /// `depots/<depot>/chunk` under the session root.
    #[default]
    Loose,
    /// The chunkstore set starting at this `.csm` / `.csd` path.
    Chunkstores(PathBuf),
}

pub fn open_source(session: &Session, depot: u32, cfg: &ChunkSourceConfig) -> Result<Box<dyn ChunkSource>> {
    Ok(match cfg {
        ChunkSourceConfig::Loose => Box::new(LooseChunks::new(session.chunk_dir(depot))),
        ChunkSourceConfig::Chunkstores(first) => {
            let set = ChunkstoreSet::open(first)?;
            if let Some(other) = set.stores().iter().find(|s| s.depot() != depot) {
                log::warn!(
                    "{} belongs to depot {}, not {}",
                    other.paths.csm.display(),
                    other.depot(),
                    depot
                );
            }
            Box::new(set)
        }
    })
}

/// Resolve, decrypt, decompress and verify one chunk. `declared_len` trims the
/// decompressed output when known.
pub fn process_chunk(
    source: &dyn ChunkSource,
    key: Option<&DepotKey>,
    sha: &ChunkSha,
    declared_len: Option<u32>,
) -> Result<Vec<u8>, ChunkError> {
    let payload = source.get(sha)?.ok_or(ChunkError::Missing)?;
    let plain = if payload.encrypted {
        let key = key.ok_or(ChunkError::MissingKey)?;
        symmetric_decrypt(&payload.bytes, key).map_err(|e| ChunkError::Decrypt(e.to_string()))?
    } else {
        payload.bytes
    };
    let data = crate::codec::decompress(&plain, declared_len.unwrap_or(u32::MAX))?;
    let actual = ChunkSha::of(&data);
    if actual != *sha {
        return Err(ChunkError::ChecksumMismatch { expected: *sha, actual });
    }
    Ok(data)
}
