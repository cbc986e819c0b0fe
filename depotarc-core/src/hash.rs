use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Content address of a chunk: SHA-1 of its decompressed bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkSha(pub [u8; 20]);

impl ChunkSha {
    pub const LEN: usize = 20;

    pub fn of(data: &[u8]) -> Self {
        ChunkSha(Sha1::digest(data).into())
    }

    pub fn from_slice(b: &[u8]) -> Result<Self> {
        if b.len() != Self::LEN {
            bail!("chunk sha must be {} bytes, got {}", Self::LEN, b.len());
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(b);
        Ok(ChunkSha(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for ChunkSha {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).with_context(|| format!("bad sha hex {:?}", s))?;
        ChunkSha::from_slice(&raw)
    }
}

impl fmt::Display for ChunkSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkSha({})", self.to_hex())
    }
}

// Serialized as lowercase hex in every JSON artifact.
impl Serialize for ChunkSha {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkSha {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming SHA-1 over a whole file, used for final-output validation.
pub fn sha1_file(path: &std::path::Path) -> Result<[u8; 20]> {
    use std::io::Read;
    let mut f = std::fs::File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut h = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.finalize().into())
}
