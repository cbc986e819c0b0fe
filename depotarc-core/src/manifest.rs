use crate::crypto::{symmetric_decrypt, DepotKey};
use crate::hash::ChunkSha;
use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Flag bit marking a directory entry.
pub const FLAG_DIRECTORY: u32 = 0x40;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkRef {
    pub sha: ChunkSha,
    pub offset: u64,
    /// Declared decompressed length.
    pub cb_original: u32,
    #[serde(default)]
    pub cb_compressed: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub flags: u32,
    /// Whole-file SHA-1; absent for directories.
    #[serde(default, with = "opt_hex20")]
    pub sha_content: Option<[u8; 20]>,
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
}

impl FileEntry {
    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    /// Chunks in increasing offset order.
    pub fn sorted_chunks(&self) -> Vec<&ChunkRef> {
        let mut v: Vec<&ChunkRef> = self.chunks.iter().collect();
        v.sort_by_key(|c| c.offset);
        v
    }

    /// Relative output path with `\` and `/` both treated as separators.
    pub fn rel_path(&self) -> PathBuf {
        self.filename.split(['\\', '/']).filter(|c| !c.is_empty()).collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Manifest {
    pub depot_id: u32,
    pub gid: u64,
    pub creation_time: i64,
    #[serde(default)]
    pub filenames_encrypted: bool,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open manifest {:?}", path))?;
        serde_json::from_reader(std::io::BufReader::new(f))
            .with_context(|| format!("parse manifest {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let f = File::create(path).with_context(|| format!("create {:?}", path))?;
        serde_json::to_writer_pretty(f, self)?;
        Ok(())
    }

    /// Cached location of a manifest under the archive root.
    pub fn cached_path(root: &Path, depot: u32, gid: u64) -> PathBuf {
        root.join("depots").join(depot.to_string()).join("manifest").join(format!("{gid}.json"))
    }

    pub fn created(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.creation_time, 0)
    }

    /// Each filename is base64 of a depot-encrypted, NUL padded string.
    pub fn decrypt_filenames(&mut self, key: &DepotKey) -> Result<()> {
        if !self.filenames_encrypted {
            return Ok(());
        }
        let b64 = base64::engine::general_purpose::STANDARD;
        for fe in &mut self.files {
            let raw = b64
                .decode(fe.filename.trim())
                .with_context(|| format!("filename is not base64: {:?}", fe.filename))?;
            let plain = symmetric_decrypt(&raw, key).context("decrypt filename")?;
            let name = String::from_utf8(plain).context("decrypted filename is not utf-8")?;
            fe.filename = name.trim_end_matches(['\0', ' ', '\n', '\t']).to_string();
        }
        self.filenames_encrypted = false;
        Ok(())
    }

    /// Distinct chunk hashes in first-seen order.
    pub fn unique_chunks(&self) -> Vec<ChunkSha> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for fe in &self.files {
            for c in &fe.chunks {
                if seen.insert(c.sha) {
                    out.push(c.sha);
                }
            }
        }
        out
    }

    pub fn ensure_plain_names(&self) -> Result<()> {
        if self.filenames_encrypted {
            bail!("manifest {} has encrypted filenames, but no depot key is available", self.gid);
        }
        Ok(())
    }
}

mod opt_hex20 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<[u8; 20]>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(b) => s.serialize_str(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 20]>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            None => Ok(None),
            Some(s) => {
                let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 20] = raw
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("sha_content must be 20 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}
