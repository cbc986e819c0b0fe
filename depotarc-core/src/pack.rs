use crate::chunkstore::{read_index, Chunkstore, IndexEntry, IndexHeader, StorePaths};
use crate::crypto::{symmetric_decrypt, symmetric_encrypt, DepotKey};
use crate::hash::ChunkSha;
use crate::session::{Observer, Session};
use crate::store::LooseChunks;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Clone, Copy, Debug, Default)]
pub struct PackOptions {
    /// Pack `<hex>_decrypted` files into a plaintext store instead of encrypted ones.
    pub decrypted: bool,
    /// Truncate an existing store instead of appending to it.
    pub overwrite: bool,
}

#[derive(Clone, Debug)]
pub struct PackReport {
    pub paths: StorePaths,
    pub added: usize,
    pub skipped: usize,
    /// Blob size after packing.
    pub bytes_total: u64,
}

/// Pack a depot's loose chunks into the chunkstore at `dest`. An existing store is
/// appended to: hashes it already indexes are skipped and the header count is
/// rewritten at the end.
pub fn pack_depot(
    session: &Session,
    depot: u32,
    dest: &StorePaths,
    opts: &PackOptions,
    observer: &dyn Observer,
) -> Result<PackReport> {
    let encrypted = !opts.decrypted;
    let loose = LooseChunks::new(session.chunk_dir(depot));
    let chunks: Vec<_> = loose.scan()?.into_iter().filter(|(_, enc, _)| *enc == encrypted).collect();
    if chunks.is_empty() {
        log::warn!("depot {depot}: no {} chunks in {}", mode(encrypted), loose.dir().display());
    }

    let mut known: HashSet<ChunkSha> = HashSet::new();
    let appending = !opts.overwrite && dest.exists();
    if appending {
        let (h, entries) = read_index(&dest.csm)?;
        if h.depot != depot {
            bail!("{} belongs to depot {}, not {}", dest.csm.display(), h.depot, depot);
        }
        if h.encrypted != encrypted {
            bail!(
                "cannot add {} chunks to {} chunkstore {}",
                mode(encrypted),
                mode(h.encrypted),
                dest.csm.display()
            );
        }
        known.extend(entries.iter().map(|e| e.sha));
        log::info!("{}: appending to {} indexed chunks", dest.csm.display(), known.len());
    }
    if let Some(dir) = dest.csm.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    }

    let open = |p: &Path| {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!appending)
            .open(p)
            .with_context(|| format!("open {:?}", p))
    };
    let mut csm = open(&dest.csm)?;
    let mut csd = open(&dest.csd)?;
    if !appending {
        csm.write_all(&IndexHeader { depot, encrypted, count: 0 }.encode())?;
    }
    let mut offset = csd.seek(SeekFrom::End(0))?;
    csm.seek(SeekFrom::End(0))?;

    let (mut added, mut skipped) = (0usize, 0usize);
    {
        let mut idx = BufWriter::new(&mut csm);
        let mut blob = BufWriter::new(&mut csd);
        let total = chunks.len();
        for (i, (sha, _, path)) in chunks.iter().enumerate() {
            if !known.insert(*sha) {
                skipped += 1;
                continue;
            }
            let bytes = fs::read(path).with_context(|| format!("read {:?}", path))?;
            blob.write_all(&bytes)?;
            idx.write_all(&IndexEntry { sha: *sha, offset, length: bytes.len() as u32 }.encode())?;
            offset += bytes.len() as u64;
            added += 1;
            observer.chunk_packed(depot, sha, i + 1, total);
        }
        blob.flush()?;
        idx.flush()?;
    }
    let count = u32::try_from(known.len()).context("too many chunks for one index")?;
    csm.seek(SeekFrom::Start(0))?;
    csm.write_all(&IndexHeader { depot, encrypted, count }.encode())?;
    csm.sync_all()?;
    csd.sync_all()?;
    log::info!("{}: {added} added, {skipped} already present, {offset} bytes", dest.csm.display());
    Ok(PackReport { paths: dest.clone(), added, skipped, bytes_total: offset })
}

fn mode(encrypted: bool) -> &'static str {
    if encrypted {
        "encrypted"
    } else {
        "plaintext"
    }
}

/// What to do with payloads while unpacking.
#[derive(Clone, Debug, Default)]
pub enum UnpackKey {
    /// Write payloads as stored.
    #[default]
    Verbatim,
    /// Write encrypted payloads decrypted.
    Decrypt(DepotKey),
    /// Write every payload encrypted with a fresh IV, replacing existing outputs.
    Reencrypt(DepotKey),
}

#[derive(Clone, Debug, Default)]
pub struct UnpackReport {
    pub depot: u32,
    pub written: usize,
    pub skipped: usize,
}

/// Explode a chunkstore into loose chunk files under the session root.
pub fn unpack_chunkstore(
    session: &Session,
    path: &Path,
    key: &UnpackKey,
    observer: &dyn Observer,
) -> Result<UnpackReport> {
    let store = Chunkstore::open(path)?;
    let depot = store.depot();
    let loose = LooseChunks::new(session.chunk_dir(depot));
    let total = store.entries().len();
    let mut report = UnpackReport { depot, ..Default::default() };
    log::info!("{}: unpacking {total} chunks for depot {depot}", store.paths.csm.display());

    for (i, e) in store.entries().iter().enumerate() {
        if session.is_cancelled() {
            break;
        }
        let out_encrypted = match key {
            UnpackKey::Verbatim => store.is_encrypted(),
            UnpackKey::Decrypt(_) => false,
            UnpackKey::Reencrypt(_) => true,
        };
        let reencrypt = matches!(key, UnpackKey::Reencrypt(_));
        if !reencrypt && loose.path_for(&e.sha, out_encrypted).is_file() {
            report.skipped += 1;
            observer.chunk_packed(depot, &e.sha, i + 1, total);
            continue;
        }
        let raw = store.slice(e);
        let bytes = match (key, store.is_encrypted()) {
            (UnpackKey::Verbatim, _) | (UnpackKey::Decrypt(_), false) => raw.to_vec(),
            (UnpackKey::Decrypt(k), true) => symmetric_decrypt(raw, k).with_context(|| format!("decrypt {}", e.sha))?,
            (UnpackKey::Reencrypt(k), true) => {
                let plain = symmetric_decrypt(raw, k).with_context(|| format!("decrypt {}", e.sha))?;
                symmetric_encrypt(&plain, k)?
            }
            (UnpackKey::Reencrypt(k), false) => symmetric_encrypt(raw, k)?,
        };
        loose.put(&e.sha, &bytes, out_encrypted)?;
        report.written += 1;
        observer.chunk_packed(depot, &e.sha, i + 1, total);
    }
    log::info!("depot {depot}: {} written, {} already present", report.written, report.skipped);
    Ok(report)
}
