mod common;

use common::DEPOT;
use depotarc_core::chunkstore::StorePaths;
use depotarc_core::error::ChunkError;
use depotarc_core::fsutil::{write_atomic, FsRetry};
use depotarc_core::hash::ChunkSha;
use depotarc_core::pack::{pack_depot, PackOptions};
use depotarc_core::path_safety::{ensure_dir_chain, validate_path, PathPolicy};
use depotarc_core::progress::ProgressLog;
use depotarc_core::session::NoopObserver;
use depotarc_core::store::{ChunkSourceConfig, LooseChunks};
use depotarc_core::validate::validate_source;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[test]
fn progress_log_persists_every_mark() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("1").join("2.progress.json");
    let log = ProgressLog::load(&path).unwrap();
    let (x, y) = (ChunkSha::of(b"x"), ChunkSha::of(b"y"));
    log.reset("dir\\file", 2).unwrap();
    log.mark("dir\\file", x).unwrap();

    let reread = ProgressLog::load(&path).unwrap();
    let rec = reread.get("dir\\file").unwrap().unwrap();
    assert_eq!(rec.total_chunks, 2);
    assert!(rec.processed_chunks.contains(&x));
    assert!(!rec.is_complete());

    log.mark("dir\\file", y).unwrap();
    assert!(ProgressLog::load(&path).unwrap().get("dir\\file").unwrap().unwrap().is_complete());
    let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(json["dir\\file"]["processed_chunks"][0].as_str().unwrap().len(), 40);

    log.reset("dir\\file", 5).unwrap();
    assert!(log.get("dir\\file").unwrap().unwrap().processed_chunks.is_empty());
}

#[test]
fn loose_names_parse_both_variants() {
    let sha = ChunkSha::of(b"n");
    assert_eq!(LooseChunks::parse_name(&sha.to_hex()), Some((sha, true)));
    assert_eq!(LooseChunks::parse_name(&format!("{}_decrypted", sha.to_hex())), Some((sha, false)));
    assert_eq!(LooseChunks::parse_name("readme.txt"), None);
    assert_eq!(LooseChunks::parse_name(&format!("{}.part", sha.to_hex())), None);
}

#[test]
fn validator_reports_bad_chunks_from_any_source() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let good = common::random_bytes(900, 1);
    common::put_chunk(&s, &good, true, true);
    common::put_chunk(&s, b"plaintext one", false, false);
    let broken = ChunkSha::of(b"broken");
    LooseChunks::new(s.chunk_dir(DEPOT)).put(&broken, b"ZZ not a container", false).unwrap();

    let r = validate_source(&s, DEPOT, Some(&common::key()), &ChunkSourceConfig::Loose, 2, &NoopObserver).unwrap();
    assert_eq!((r.total, r.ok), (3, 2));
    assert_eq!(r.bad.len(), 1);
    assert_eq!(r.bad[0].sha, broken);
    assert!(matches!(r.bad[0].reason, ChunkError::UnknownFormat(_)));

    let no_key = validate_source(&s, DEPOT, None, &ChunkSourceConfig::Loose, 2, &NoopObserver).unwrap();
    assert_eq!(no_key.ok, 1);
    assert!(no_key.bad.iter().any(|b| matches!(b.reason, ChunkError::MissingKey)));

    let store = StorePaths::in_dir(td.path(), DEPOT, 1);
    pack_depot(&s, DEPOT, &store, &PackOptions::default(), &NoopObserver).unwrap();
    let packed =
        validate_source(&s, DEPOT, Some(&common::key()), &ChunkSourceConfig::Chunkstores(store.csm), 2, &NoopObserver)
            .unwrap();
    assert_eq!((packed.total, packed.ok), (1, 1));
}

#[test]
fn atomic_writes_and_preallocation() {
    let td = tempfile::tempdir().unwrap();
    let p = td.path().join("chunk");
    write_atomic(&p, b"abc").unwrap();
    assert_eq!(fs::read(&p).unwrap(), b"abc");
    assert!(!td.path().join("chunk.part").exists());

    let retry = FsRetry { attempts: 2, backoff: Duration::from_millis(1) };
    let f = td.path().join("f.incomplete");
    retry.preallocate(&f, 10).unwrap();
    fs::write(&f, b"0123456789").unwrap();
    // reopening keeps what was already written
    retry.preallocate(&f, 10).unwrap();
    assert_eq!(fs::read(&f).unwrap(), b"0123456789");
    retry.preallocate(&f, 16).unwrap();
    assert_eq!(fs::metadata(&f).unwrap().len(), 16);
}

#[test]
fn unsafe_paths_are_rejected() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path();
    let policy = PathPolicy::default();
    assert!(validate_path(root, Path::new("a/b.txt"), policy).is_ok());
    assert!(validate_path(root, Path::new("../x"), policy).is_err());
    assert!(validate_path(root, Path::new("a/../../x"), policy).is_err());
    assert!(validate_path(root, Path::new("/etc/passwd"), policy).is_err());
}

#[cfg(target_family = "unix")]
#[test]
fn symlinked_component_needs_opt_in() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("root");
    fs::create_dir_all(root.join("real")).unwrap();
    std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();
    let rel = Path::new("link/f.bin");
    assert!(validate_path(&root, rel, PathPolicy::default()).is_err());
    assert_eq!(validate_path(&root, rel, PathPolicy { follow_symlinks: true }).unwrap(), root.join(rel));
}

#[test]
fn dir_chain_replaces_blocking_files() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path();
    fs::write(root.join("a"), b"x").unwrap();
    let replaced = ensure_dir_chain(root, &root.join("a/b/c")).unwrap();
    assert_eq!(replaced, vec![root.join("a")]);
    assert!(root.join("a/b/c").is_dir());
    assert!(ensure_dir_chain(root, &root.join("a/b/c")).unwrap().is_empty());
}
