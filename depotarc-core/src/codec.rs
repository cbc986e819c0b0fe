//! Chunk payload containers.
//!
//! A decrypted chunk starts with a two byte magic:
//! - `VZ`: `"VZa"` + u32 stamp + 5 byte LZMA properties + raw LZMA stream
//!   + u32 CRC-32 of the output + u32 original size + `"zv"`
//! - `PK`: a zip archive holding exactly one entry

use crate::error::ChunkError;
use anyhow::{Context, Result};
use std::io::{Cursor, Read, Write};

pub const VZ_MAGIC: &[u8; 2] = b"VZ";
pub const PK_MAGIC: &[u8; 2] = b"PK";
const VZ_HEADER_LEN: usize = 12; // "VZa" + stamp(4) + props(5)
const VZ_FOOTER_LEN: usize = 10; // crc(4) + size(4) + "zv"
const VZ_FOOTER_MAGIC: &[u8; 2] = b"zv";
/// Upper bound on output preallocation. Real chunks decompress to about 1 MiB;
/// sizes read from a payload are untrusted.
const MAX_SIZE_HINT: u64 = 16 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Container {
    Vz,
    Pk,
}

pub fn sniff(payload: &[u8]) -> std::result::Result<Container, ChunkError> {
    match payload.get(..2) {
        Some(m) if m == VZ_MAGIC => Ok(Container::Vz),
        Some(m) if m == PK_MAGIC => Ok(Container::Pk),
        Some(m) => Err(ChunkError::UnknownFormat([m[0], m[1]])),
        None => Err(ChunkError::UnknownFormat([0, 0])),
    }
}

/// Decompress a decrypted payload, trimming to the declared length.
pub fn decompress(payload: &[u8], declared_len: u32) -> std::result::Result<Vec<u8>, ChunkError> {
    match sniff(payload)? {
        Container::Vz => decompress_vz(payload, declared_len),
        Container::Pk => decompress_pk(payload, declared_len),
    }
}

fn decompress_vz(data: &[u8], declared_len: u32) -> std::result::Result<Vec<u8>, ChunkError> {
    if data.len() < VZ_HEADER_LEN + VZ_FOOTER_LEN {
        return Err(ChunkError::Decompress(format!("VZ payload too short ({} bytes)", data.len())));
    }
    let foot = &data[data.len() - VZ_FOOTER_LEN..];
    if &foot[8..10] != VZ_FOOTER_MAGIC {
        return Err(ChunkError::Decompress("VZ footer magic missing".into()));
    }
    let crc = u32::from_le_bytes([foot[0], foot[1], foot[2], foot[3]]);
    let size = u32::from_le_bytes([foot[4], foot[5], foot[6], foot[7]]);

    let props = &data[7..VZ_HEADER_LEN];
    let stream = &data[VZ_HEADER_LEN..data.len() - VZ_FOOTER_LEN];
    // sized by the footer; lzma-rs output ends in an end marker instead
    let hint = size_hint(size as u64, declared_len);
    let mut out =
        lzma_raw(props, stream, Some(size as u64), hint).or_else(|_| lzma_raw(props, stream, None, hint))?;
    if crc32fast::hash(&out) != crc {
        log::warn!("VZ footer crc mismatch ({} bytes decoded)", out.len());
    }
    out.truncate(declared_len as usize);
    Ok(out)
}

fn lzma_raw(
    props: &[u8],
    stream: &[u8],
    size: Option<u64>,
    hint: usize,
) -> std::result::Result<Vec<u8>, ChunkError> {
    let opts = lzma_rs::decompress::Options {
        unpacked_size: lzma_rs::decompress::UnpackedSize::UseProvided(size),
        ..Default::default()
    };
    let mut out = Vec::with_capacity(hint);
    lzma_rs::lzma_decompress_with_options(&mut Cursor::new(props).chain(stream), &mut out, &opts)
        .map_err(|e| ChunkError::Decompress(e.to_string()))?;
    Ok(out)
}

fn size_hint(claimed: u64, declared_len: u32) -> usize {
    claimed.min(declared_len as u64).min(MAX_SIZE_HINT) as usize
}

fn decompress_pk(data: &[u8], declared_len: u32) -> std::result::Result<Vec<u8>, ChunkError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| ChunkError::Decompress(format!("zip: {e}")))?;
    if archive.is_empty() {
        return Err(ChunkError::Decompress("zip has no entries".into()));
    }
    let entry = archive.by_index(0).map_err(|e| ChunkError::Decompress(format!("zip: {e}")))?;
    let mut out = Vec::with_capacity(size_hint(entry.size(), declared_len));
    entry.take(declared_len as u64).read_to_end(&mut out)?;
    Ok(out)
}

/// Build a `VZ` payload.
pub fn compress_vz(data: &[u8]) -> Result<Vec<u8>> {
    let mut lz = Vec::new();
    lzma_rs::lzma_compress(&mut Cursor::new(data), &mut lz).context("lzma compress")?;
    // lz = props(5) + unpacked size(8) + stream
    let mut out = Vec::with_capacity(lz.len() + VZ_FOOTER_LEN);
    out.extend_from_slice(b"VZa");
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&lz[..5]);
    out.extend_from_slice(&lz[13..]);
    out.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(VZ_FOOTER_MAGIC);
    Ok(out)
}

/// Build a single-entry `PK` payload.
pub fn compress_pk(data: &[u8]) -> Result<Vec<u8>> {
    let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    w.start_file("z", opts).context("zip start entry")?;
    w.write_all(data)?;
    let cur = w.finish().context("zip finish")?;
    Ok(cur.into_inner())
}

/// Length of a zip stored at the start of `blob`, found from its end of central
/// directory record. Older indexes left entry lengths at zero.
#[cfg(feature = "legacy-index")]
pub fn infer_zip_length(blob: &[u8]) -> Option<usize> {
    const EOCD: &[u8; 4] = b"PK\x05\x06";
    const EOCD_LEN: usize = 22;
    let pos = blob.windows(4).position(|w| w == EOCD)?;
    let comment = blob.get(pos + 20..pos + 22)?;
    let end = pos + EOCD_LEN + u16::from_le_bytes([comment[0], comment[1]]) as usize;
    (end <= blob.len()).then_some(end)
}
