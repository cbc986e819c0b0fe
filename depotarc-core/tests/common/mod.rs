#![allow(dead_code)]

use depotarc_core::codec::{compress_pk, compress_vz};
use depotarc_core::crypto::{symmetric_encrypt, DepotKey};
use depotarc_core::hash::ChunkSha;
use depotarc_core::manifest::{ChunkRef, FileEntry, Manifest, FLAG_DIRECTORY};
use depotarc_core::session::Session;
use depotarc_core::store::LooseChunks;
use sha1::{Digest, Sha1};

pub const DEPOT: u32 = 228990;
pub const GID: u64 = 1829726630299308803;
pub const KEY_HEX: &str = "4b6e1c3d2a79f0e85c1d7a3b9e2f406158c7d3a1e0b94f27c6d8a5b3f1e29c70";

pub fn key() -> DepotKey {
    DepotKey::from_hex(KEY_HEX).unwrap()
}

pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| rng.u8(..)).collect()
}

pub fn session(td: &tempfile::TempDir) -> Session {
    Session::new(td.path().join("archive"), td.path().join("out"))
}

/// `VZ` or `PK` payload for `data`.
pub fn payload(data: &[u8], vz: bool) -> Vec<u8> {
    if vz {
        compress_vz(data).unwrap()
    } else {
        compress_pk(data).unwrap()
    }
}

/// Store `data` as a loose chunk of `DEPOT`, encrypted with `key()` when asked.
pub fn put_chunk(s: &Session, data: &[u8], encrypted: bool, vz: bool) -> ChunkSha {
    let sha = ChunkSha::of(data);
    let mut bytes = payload(data, vz);
    if encrypted {
        bytes = symmetric_encrypt(&bytes, &key()).unwrap();
    }
    LooseChunks::new(s.chunk_dir(DEPOT)).put(&sha, &bytes, encrypted).unwrap();
    sha
}

/// File entry made of `parts` laid out back to back.
pub fn file_entry(name: &str, parts: &[&[u8]]) -> FileEntry {
    let mut chunks = Vec::new();
    let mut whole = Vec::new();
    for p in parts {
        chunks.push(ChunkRef {
            sha: ChunkSha::of(p),
            offset: whole.len() as u64,
            cb_original: p.len() as u32,
            cb_compressed: 0,
        });
        whole.extend_from_slice(p);
    }
    FileEntry {
        filename: name.to_string(),
        size: whole.len() as u64,
        flags: 0,
        sha_content: Some(Sha1::digest(&whole).into()),
        chunks,
    }
}

pub fn dir_entry(name: &str) -> FileEntry {
    FileEntry { filename: name.to_string(), size: 0, flags: FLAG_DIRECTORY, sha_content: None, chunks: vec![] }
}

pub fn manifest(files: Vec<FileEntry>) -> Manifest {
    Manifest { depot_id: DEPOT, gid: GID, creation_time: 1_700_000_000, filenames_encrypted: false, files }
}
