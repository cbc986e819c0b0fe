use crate::crypto::DepotKey;
use crate::error::BadChunk;
use crate::session::{Observer, Session};
use crate::store::{open_source, process_chunk, ChunkSourceConfig};
use anyhow::{anyhow, Context, Result};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ValidateReport {
    pub total: usize,
    pub ok: usize,
    pub bad: Vec<BadChunk>,
}

/// Decrypt, decompress and hash-check every chunk a source holds.
pub fn validate_source(
    session: &Session,
    depot: u32,
    key: Option<&DepotKey>,
    source: &ChunkSourceConfig,
    threads: usize,
    observer: &dyn Observer,
) -> Result<ValidateReport> {
    use rayon::prelude::*;
    let src = open_source(session, depot, source)?;
    let shas = src.list()?;
    log::info!("validating {} chunks from {}", shas.len(), src.describe());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .context("build worker pool")?;
    let bad = Mutex::new(Vec::new());
    let src = src.as_ref();
    let ok = pool.install(|| {
        shas.par_iter()
            .filter(|_| !session.is_cancelled())
            .filter(|sha| match process_chunk(src, key, sha, None) {
                Ok(_) => true,
                Err(reason) => {
                    log::warn!("chunk {sha}: {reason}");
                    observer.chunk_failed(sha, &reason);
                    if let Ok(mut g) = bad.lock() {
                        g.push(BadChunk { sha: **sha, reason });
                    }
                    false
                }
            })
            .count()
    });
    let mut bad = bad.into_inner().map_err(|_| anyhow!("bad list lock poisoned"))?;
    bad.sort_by_key(|b| b.sha);
    Ok(ValidateReport { total: shas.len(), ok, bad })
}
