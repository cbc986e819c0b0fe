mod common;

use common::{DEPOT, GID};
use depotarc_core::chunkstore::StorePaths;
use depotarc_core::error::ChunkError;
use depotarc_core::extract::{
    extract_manifest, progress_path, ExtractConfig, FileState, OrderedWriter, CORRUPTED_SUFFIX, INCOMPLETE_SUFFIX,
};
use depotarc_core::hash::ChunkSha;
use depotarc_core::pack::{pack_depot, PackOptions};
use depotarc_core::progress::ProgressLog;
use depotarc_core::session::NoopObserver;
use depotarc_core::store::{ChunkSourceConfig, LooseChunks};
use std::fs;
use std::io::Cursor;
use std::sync::Arc;

fn key() -> Option<depotarc_core::crypto::DepotKey> {
    Some(common::key())
}

#[test]
fn three_entry_manifest_from_chunkstore() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let a1 = common::random_bytes(5000, 11);
    let a2 = common::random_bytes(3000, 12);
    let b1 = common::random_bytes(700, 13);
    for (part, vz) in [(&a1, true), (&a2, false), (&b1, true)] {
        common::put_chunk(&s, part, true, vz);
    }
    let store = StorePaths::in_dir(&td.path().join("backup"), DEPOT, 1);
    pack_depot(&s, DEPOT, &store, &PackOptions::default(), &NoopObserver).unwrap();
    fs::remove_dir_all(s.chunk_dir(DEPOT)).unwrap();

    let m = common::manifest(vec![
        common::dir_entry("data"),
        common::file_entry("data\\a.bin", &[&a1, &a2]),
        common::file_entry("b.bin", &[&b1]),
    ]);
    let cfg = ExtractConfig { source: ChunkSourceConfig::Chunkstores(store.csm.clone()), validate: true, ..Default::default() };
    let r = extract_manifest(&s, &m, key().as_ref(), &cfg, &NoopObserver).unwrap();

    assert!(r.success());
    assert_eq!(r.directories, 1);
    assert_eq!(r.count(FileState::Complete), 2);
    let out = s.output_dir(DEPOT, GID);
    assert!(out.join("data").is_dir());
    assert_eq!(fs::read(out.join("data/a.bin")).unwrap(), [a1, a2].concat());
    assert_eq!(fs::read(out.join("b.bin")).unwrap(), b1);
    assert!(!out.join("data/a.bin.incomplete").exists());

    let log = ProgressLog::load(&progress_path(&s, DEPOT, GID)).unwrap();
    let a = log.get("data\\a.bin").unwrap().unwrap();
    let b = log.get("b.bin").unwrap().unwrap();
    assert_eq!(a.processed_chunks.len() + b.processed_chunks.len(), 3);
    assert!(a.is_complete() && b.is_complete());

    // second run is a no-op
    let again = extract_manifest(&s, &m, key().as_ref(), &cfg, &NoopObserver).unwrap();
    assert_eq!(again.count(FileState::AlreadyPresent), 2);
}

#[test]
fn missing_chunk_leaves_file_incomplete() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let a1 = common::random_bytes(4000, 21);
    let a2 = common::random_bytes(4000, 22);
    let b1 = common::random_bytes(900, 23);
    common::put_chunk(&s, &a1, true, true);
    common::put_chunk(&s, &b1, true, true);

    let m = common::manifest(vec![common::file_entry("a.bin", &[&a1, &a2]), common::file_entry("b.bin", &[&b1])]);
    let r = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();

    assert!(!r.success());
    assert_eq!(r.bad_chunks.len(), 1);
    assert_eq!(r.bad_chunks[0].sha, ChunkSha::of(&a2));
    assert!(matches!(r.bad_chunks[0].reason, ChunkError::Missing));
    let out = s.output_dir(DEPOT, GID);
    assert!(out.join(format!("a.bin{INCOMPLETE_SUFFIX}")).is_file());
    assert!(!out.join("a.bin").exists());
    assert_eq!(fs::read(out.join("b.bin")).unwrap(), b1);

    let a = r.files.iter().find(|f| f.path == "a.bin").unwrap();
    assert_eq!((a.state, a.chunks_done, a.chunks_total), (FileState::Incomplete, 1, 2));
}

#[test]
fn resumed_extraction_matches_uninterrupted_run() {
    let parts: Vec<Vec<u8>> = (0..6).map(|i| common::random_bytes(1500 + i * 100, 30 + i as u64)).collect();
    let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
    let m = common::manifest(vec![common::file_entry("big.bin", &refs)]);

    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    // only the first half is available on the first run
    for p in &parts[..3] {
        common::put_chunk(&s, p, true, true);
    }
    let first = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();
    assert_eq!(first.files[0].state, FileState::Incomplete);
    assert_eq!(first.files[0].chunks_done, 3);

    // remove a processed chunk: resume must not need it again
    fs::remove_file(LooseChunks::new(s.chunk_dir(DEPOT)).path_for(&ChunkSha::of(&parts[0]), true)).unwrap();
    for p in &parts[3..] {
        common::put_chunk(&s, p, true, false);
    }
    let second = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();
    assert!(second.success(), "{:?}", second.bad_chunks);
    assert_eq!(fs::read(s.output_dir(DEPOT, GID).join("big.bin")).unwrap(), parts.concat());
}

#[test]
fn progress_without_incomplete_file_is_reset() {
    let a = common::random_bytes(2000, 41);
    let b = common::random_bytes(2000, 42);
    let m = common::manifest(vec![common::file_entry("f.bin", &[&a, &b])]);
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    common::put_chunk(&s, &a, true, true);
    extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();

    let out = s.output_dir(DEPOT, GID);
    fs::remove_file(out.join(format!("f.bin{INCOMPLETE_SUFFIX}"))).unwrap();
    common::put_chunk(&s, &b, true, true);
    let r = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();
    assert!(r.success());
    assert_eq!(fs::read(out.join("f.bin")).unwrap(), [a, b].concat());
}

#[test]
fn corrupted_payload_is_rejected_not_written() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let good = common::random_bytes(3000, 51);
    let sha = ChunkSha::of(&good);
    // store a valid payload of different bytes under the good chunk's address
    let forged = common::payload(&common::random_bytes(3000, 52), true);
    let enc = depotarc_core::crypto::symmetric_encrypt(&forged, &common::key()).unwrap();
    LooseChunks::new(s.chunk_dir(DEPOT)).put(&sha, &enc, true).unwrap();

    let m = common::manifest(vec![common::file_entry("x.bin", &[&good])]);
    let r = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();
    assert_eq!(r.bad_chunks.len(), 1);
    assert!(matches!(r.bad_chunks[0].reason, ChunkError::ChecksumMismatch { expected, .. } if expected == sha));
    assert!(!s.output_dir(DEPOT, GID).join("x.bin").exists());
}

#[test]
fn missing_key_is_a_bad_chunk_not_an_abort() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let enc = common::random_bytes(100, 61);
    let plain = common::random_bytes(100, 62);
    common::put_chunk(&s, &enc, true, true);
    common::put_chunk(&s, &plain, false, true);
    let m = common::manifest(vec![common::file_entry("e.bin", &[&enc]), common::file_entry("p.bin", &[&plain])]);
    let r = extract_manifest(&s, &m, None, &ExtractConfig::default(), &NoopObserver).unwrap();
    assert!(matches!(r.bad_chunks[0].reason, ChunkError::MissingKey));
    assert_eq!(fs::read(s.output_dir(DEPOT, GID).join("p.bin")).unwrap(), plain);
}

#[test]
fn validation_mismatch_renames_to_corrupted() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let data = common::random_bytes(800, 71);
    common::put_chunk(&s, &data, true, true);
    let mut fe = common::file_entry("v.bin", &[&data]);
    fe.sha_content = Some([0u8; 20]);
    let m = common::manifest(vec![fe]);
    let cfg = ExtractConfig { validate: true, ..Default::default() };
    let r = extract_manifest(&s, &m, key().as_ref(), &cfg, &NoopObserver).unwrap();
    assert_eq!(r.files[0].state, FileState::Corrupted);
    assert!(!r.success());
    let out = s.output_dir(DEPOT, GID);
    assert_eq!(fs::read(out.join(format!("v.bin{CORRUPTED_SUFFIX}"))).unwrap(), data);
    assert!(!out.join("v.bin").exists());
}

#[test]
fn file_in_place_of_directory_is_replaced() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let data = common::random_bytes(300, 81);
    common::put_chunk(&s, &data, true, true);
    let out = s.output_dir(DEPOT, GID);
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("sub"), b"stale file").unwrap();

    let m = common::manifest(vec![common::file_entry("sub/deep/f.bin", &[&data])]);
    let r = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();
    assert!(r.success());
    assert_eq!(fs::read(out.join("sub/deep/f.bin")).unwrap(), data);
}

#[test]
fn filters_and_dry_run() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let a = common::random_bytes(200, 91);
    let b = common::random_bytes(200, 92);
    common::put_chunk(&s, &a, true, true);
    common::put_chunk(&s, &b, true, false);
    let m = common::manifest(vec![
        common::dir_entry("save"),
        common::file_entry("bin/a.dll", &[&a]),
        common::file_entry("docs/b.txt", &[&b]),
    ]);

    let dry = ExtractConfig { dry_run: true, ..Default::default() };
    let r = extract_manifest(&s, &m, key().as_ref(), &dry, &NoopObserver).unwrap();
    assert_eq!(r.count(FileState::DryRun), 2);
    assert!(r.success());
    assert!(!s.output_dir(DEPOT, GID).exists());

    let only_dll = ExtractConfig { filters: vec!["**/*.dll".into()], ..Default::default() };
    let r = extract_manifest(&s, &m, key().as_ref(), &only_dll, &NoopObserver).unwrap();
    assert_eq!(r.files.len(), 1);
    let out = s.output_dir(DEPOT, GID);
    assert!(out.join("bin/a.dll").is_file());
    assert!(!out.join("docs/b.txt").exists());
    // directory entries are laid out whatever the filter
    assert!(out.join("save").is_dir());
    assert_eq!(r.directories, 1);
}

#[test]
fn directory_at_output_path_blocks_the_file_and_fails_the_run() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let data = common::random_bytes(300, 97);
    common::put_chunk(&s, &data, true, true);
    let m = common::manifest(vec![common::file_entry("game/data.bin", &[&data])]);
    let out = s.output_dir(DEPOT, GID);
    fs::create_dir_all(out.join("game/data.bin")).unwrap();

    let r = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();
    assert_eq!(r.count(FileState::Blocked), 1);
    assert!(!r.success());
    assert!(out.join("game/data.bin").is_dir());
}

#[test]
fn traversal_in_manifest_path_is_refused() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let data = common::random_bytes(50, 95);
    common::put_chunk(&s, &data, true, true);
    let m = common::manifest(vec![common::file_entry("..\\escape.bin", &[&data])]);
    assert!(extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).is_err());
    assert!(!td.path().join("out").join(DEPOT.to_string()).join("escape.bin").exists());
}

#[test]
fn ordered_writer_writes_by_offset_whatever_the_completion_order() {
    let parts: Vec<Vec<u8>> = (0..16).map(|i| common::random_bytes(37 + i * 11, 100 + i as u64)).collect();
    let mut offsets = Vec::new();
    let mut at = 0u64;
    for p in &parts {
        offsets.push(at);
        at += p.len() as u64;
    }
    let mut order: Vec<usize> = (0..parts.len()).collect();
    fastrand::seed(0x5EED);
    fastrand::shuffle(&mut order);

    let mut w = OrderedWriter::new();
    for &i in &order {
        w.push(offsets[i], ChunkSha::of(&parts[i]), Arc::new(parts[i].clone()));
    }
    assert_eq!(w.len(), parts.len());
    let mut out = Cursor::new(vec![0u8; at as usize]);
    let mut seen = Vec::new();
    while let Some((off, sha)) = w.write_next(&mut out).unwrap() {
        seen.push(off);
        assert_eq!(sha, ChunkSha::of(&parts[offsets.iter().position(|&o| o == off).unwrap()]));
    }
    assert!(w.is_empty());
    assert_eq!(seen, offsets);
    assert_eq!(out.into_inner(), parts.concat());
}

#[test]
fn repeated_chunk_within_one_file() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let block = common::random_bytes(1024, 111);
    let tail = common::random_bytes(10, 112);
    common::put_chunk(&s, &block, true, true);
    common::put_chunk(&s, &tail, true, true);
    let m = common::manifest(vec![common::file_entry("rep.bin", &[&block, &block, &tail, &block])]);
    let r = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig { validate: true, ..Default::default() }, &NoopObserver)
        .unwrap();
    assert!(r.success());
    assert_eq!(r.files[0].chunks_total, 2);
    assert_eq!(
        fs::read(s.output_dir(DEPOT, GID).join("rep.bin")).unwrap(),
        [&block[..], &block[..], &tail[..], &block[..]].concat()
    );
}

#[test]
fn cancelled_session_writes_nothing_and_reports_interrupted() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let a = common::random_bytes(2000, 70);
    common::put_chunk(&s, &a, true, true);
    let m = common::manifest(vec![common::file_entry("a.bin", &[&a])]);
    s.cancel();
    let r = extract_manifest(&s, &m, key().as_ref(), &ExtractConfig::default(), &NoopObserver).unwrap();
    assert!(r.interrupted);
    assert!(!r.success());
    assert!(r.files.is_empty());
    assert!(!s.output_dir(DEPOT, GID).join("a.bin").exists());
}
