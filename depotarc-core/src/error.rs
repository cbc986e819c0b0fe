use crate::hash::ChunkSha;
use thiserror::Error;

/// Why a single chunk could not be materialized. Localized to that chunk;
/// the surrounding file or run carries on.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("missing chunk")]
    Missing,
    #[error("chunk is encrypted, but no depot key was specified")]
    MissingKey,
    #[error("unable to decrypt: {0}")]
    Decrypt(String),
    #[error("unknown archive type {0:?}")]
    UnknownFormat([u8; 2]),
    #[error("failed to decompress: {0}")]
    Decompress(String),
    #[error("sha1 checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: ChunkSha, actual: ChunkSha },
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one fetch attempt against one server.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Client-error status: access problem, never retried.
    #[error("received status code {status}")]
    Fatal { status: u16 },
    /// Anything worth rotating servers over.
    #[error("{0}")]
    Transient(String),
}

impl FetchError {
    pub fn from_status(status: u16) -> Self {
        if (400..500).contains(&status) {
            FetchError::Fatal { status }
        } else {
            FetchError::Transient(format!("received status code {status}"))
        }
    }
}

/// A chunk recorded as permanently bad for this run.
#[derive(Debug)]
pub struct BadChunk {
    pub sha: ChunkSha,
    pub reason: ChunkError,
}
