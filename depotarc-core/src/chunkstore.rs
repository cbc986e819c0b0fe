use crate::hash::ChunkSha;
use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Index (`.csm`) layout:
/// header: magic(4) "SCFS" + version(u32 LE) 0x14 + flags(u32 LE) + depot(u32 LE) + count(u32 LE)
/// entry:  sha(20) + offset(u64 LE) + reserved(u32 LE) + length(u32 LE)
pub const CSM_MAGIC: &[u8; 4] = b"SCFS";
pub const CSM_VERSION: u32 = 0x14;
pub const HEADER_LEN: usize = 20;
pub const ENTRY_LEN: usize = 36;
pub const FLAGS_PLAINTEXT: u32 = 2;
pub const FLAGS_ENCRYPTED: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexHeader {
    pub depot: u32,
    pub encrypted: bool,
    pub count: u32,
}

impl IndexHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0..4].copy_from_slice(CSM_MAGIC);
        b[4..8].copy_from_slice(&CSM_VERSION.to_le_bytes());
        let flags = if self.encrypted { FLAGS_ENCRYPTED } else { FLAGS_PLAINTEXT };
        b[8..12].copy_from_slice(&flags.to_le_bytes());
        b[12..16].copy_from_slice(&self.depot.to_le_bytes());
        b[16..20].copy_from_slice(&self.count.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_LEN {
            bail!("index too short for header ({} bytes)", b.len());
        }
        if &b[0..4] != CSM_MAGIC {
            bail!("not a chunkstore index (bad magic)");
        }
        let flags = u32::from_le_bytes([b[8], b[9], b[10], b[11]]);
        Ok(IndexHeader {
            // only the low half carries the mode
            encrypted: flags & 0xFFFF == FLAGS_ENCRYPTED,
            depot: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
            count: u32::from_le_bytes([b[16], b[17], b[18], b[19]]),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub sha: ChunkSha,
    pub offset: u64,
    pub length: u32,
}

impl IndexEntry {
    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut b = [0u8; ENTRY_LEN];
        b[0..20].copy_from_slice(self.sha.as_bytes());
        b[20..28].copy_from_slice(&self.offset.to_le_bytes());
        // 28..32 reserved
        b[32..36].copy_from_slice(&self.length.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        let mut off8 = [0u8; 8];
        off8.copy_from_slice(&b[20..28]);
        let mut len4 = [0u8; 4];
        len4.copy_from_slice(&b[32..36]);
        Ok(IndexEntry {
            sha: ChunkSha::from_slice(&b[0..20])?,
            offset: u64::from_le_bytes(off8),
            length: u32::from_le_bytes(len4),
        })
    }
}

/// Read and decode a whole `.csm` file.
pub fn read_index(csm: &Path) -> Result<(IndexHeader, Vec<IndexEntry>)> {
    let mut buf = Vec::new();
    File::open(csm)
        .with_context(|| format!("open {:?}", csm))?
        .read_to_end(&mut buf)?;
    let header = IndexHeader::decode(&buf).with_context(|| format!("{}", csm.display()))?;
    let body = &buf[HEADER_LEN..];
    if body.len() % ENTRY_LEN != 0 {
        bail!("{}: truncated index entry ({} trailing bytes)", csm.display(), body.len() % ENTRY_LEN);
    }
    let entries = body.chunks_exact(ENTRY_LEN).map(IndexEntry::decode).collect::<Result<Vec<_>>>()?;
    if entries.len() != header.count as usize {
        log::warn!(
            "{}: header lists {} entries, found {}",
            csm.display(),
            header.count,
            entries.len()
        );
    }
    Ok((header, entries))
}

/// `<depot>_depotcache_<index>`, the stem shared by a store's `.csm` and `.csd`.
pub fn store_stem(depot: u32, index: u32) -> String {
    format!("{depot}_depotcache_{index}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePaths {
    pub csm: PathBuf,
    pub csd: PathBuf,
}

impl StorePaths {
    /// Accepts the stem, the `.csm` or the `.csd` path.
    pub fn from_any(p: &Path) -> Self {
        let base = match p.extension().and_then(|e| e.to_str()) {
            Some("csm") | Some("csd") => p.with_extension(""),
            _ => p.to_path_buf(),
        };
        StorePaths { csm: base.with_extension("csm"), csd: base.with_extension("csd") }
    }

    pub fn in_dir(dir: &Path, depot: u32, index: u32) -> Self {
        Self::from_any(&dir.join(store_stem(depot, index)))
    }

    pub fn exists(&self) -> bool {
        self.csm.is_file() && self.csd.is_file()
    }

    /// All `<prefix>_<n>.csm` siblings of a `<prefix>_1.csm` / `.csd` path.
    pub fn siblings(first: &Path) -> Result<Vec<StorePaths>> {
        let me = Self::from_any(first);
        let dir = me.csm.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let stem = me.csm.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let prefix = match stem.rsplit_once('_') {
            Some((p, n)) if n.chars().all(|c| c.is_ascii_digit()) => format!("{p}_"),
            _ => return Ok(vec![me]),
        };
        let mut out = Vec::new();
        for ent in fs::read_dir(&dir).with_context(|| format!("read dir {:?}", dir))? {
            let p = ent?.path();
            let Some(name) = p.file_name().and_then(|s| s.to_str()) else { continue };
            let Some(rest) = name.strip_prefix(&prefix).and_then(|r| r.strip_suffix(".csm")) else {
                continue;
            };
            if !rest.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(n) = rest.parse::<u64>() {
                out.push((n, Self::from_any(&p)));
            }
        }
        // numeric order: _2 before _10
        out.sort_by_key(|(n, _)| *n);
        Ok(out.into_iter().map(|(_, sp)| sp).collect())
    }
}

/// An opened chunkstore: decoded index plus the memory-mapped blob file.
pub struct Chunkstore {
    pub paths: StorePaths,
    pub header: IndexHeader,
    entries: Vec<IndexEntry>,
    by_sha: HashMap<ChunkSha, usize>,
    blob: Option<Mmap>,
}

impl Chunkstore {
    pub fn open(path: &Path) -> Result<Self> {
        let paths = StorePaths::from_any(path);
        let (header, mut entries) = read_index(&paths.csm)?;
        let f = File::open(&paths.csd).with_context(|| format!("open {:?}", paths.csd))?;
        let blob_len = f.metadata()?.len();
        let blob = if blob_len == 0 {
            None
        } else {
            // Safety: the blob is treated as read-only for the lifetime of the map.
            Some(unsafe { Mmap::map(&f) }.with_context(|| format!("mmap {:?}", paths.csd))?)
        };
        let data: &[u8] = blob.as_deref().unwrap_or(&[]);
        for e in entries.iter_mut() {
            #[cfg(feature = "legacy-index")]
            {
                if e.length == 0 {
                    let start = usize::try_from(e.offset).ok().filter(|&o| o <= data.len());
                    if let Some(n) = start.and_then(|s| crate::codec::infer_zip_length(&data[s..])) {
                        e.length = n as u32;
                    }
                }
            }
            let end = e.offset.checked_add(e.length as u64);
            if end.map_or(true, |end| end > data.len() as u64) {
                bail!(
                    "{}: entry {} [{}+{}] lies outside the blob ({} bytes)",
                    paths.csm.display(),
                    e.sha,
                    e.offset,
                    e.length,
                    data.len()
                );
            }
        }
        let by_sha = entries.iter().enumerate().map(|(i, e)| (e.sha, i)).collect();
        Ok(Chunkstore { paths, header, entries, by_sha, blob })
    }

    pub fn depot(&self) -> u32 {
        self.header.depot
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.encrypted
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn contains(&self, sha: &ChunkSha) -> bool {
        self.by_sha.contains_key(sha)
    }

    pub fn get(&self, sha: &ChunkSha) -> Option<&[u8]> {
        let e = &self.entries[*self.by_sha.get(sha)?];
        Some(self.slice(e))
    }

    pub fn slice(&self, e: &IndexEntry) -> &[u8] {
        let data: &[u8] = self.blob.as_deref().unwrap_or(&[]);
        // bounds were checked on open
        &data[e.offset as usize..e.offset as usize + e.length as usize]
    }
}

#[derive(Serialize, Debug)]
pub struct IndexDump {
    pub depot: u32,
    pub is_encrypted: bool,
    pub chunks: Vec<IndexEntry>,
}

impl IndexDump {
    pub fn read(csm: &Path) -> Result<Self> {
        let (h, entries) = read_index(csm)?;
        Ok(IndexDump { depot: h.depot, is_encrypted: h.encrypted, chunks: entries })
    }

    /// Write `<name>.json` next to every `.csm` in `dir`; returns the files written.
    pub fn write_all(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut csms: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|s| s == "csm").unwrap_or(false))
            .collect();
        csms.sort();
        for csm in csms {
            let dump = Self::read(&csm)?;
            let out = csm.with_extension("json");
            serde_json::to_writer_pretty(File::create(&out)?, &dump)?;
            written.push(out);
        }
        Ok(written)
    }
}
