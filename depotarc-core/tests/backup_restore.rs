mod common;

use common::{DEPOT, GID};
use depotarc_core::backup::{base_dir, locate, restore, SkuDescriptor};
use depotarc_core::chunkstore::StorePaths;
use depotarc_core::pack::{pack_depot, PackOptions, UnpackKey};
use depotarc_core::session::NoopObserver;
use depotarc_core::store::{ChunkSource, LooseChunks};
use std::fs;
use std::path::{Path, PathBuf};

fn touch_store(dir: &Path, depot: u32, index: u32) -> StorePaths {
    fs::create_dir_all(dir).unwrap();
    let p = StorePaths::in_dir(dir, depot, index);
    fs::write(&p.csm, b"").unwrap();
    fs::write(&p.csd, b"").unwrap();
    p
}

#[test]
fn locate_search_order() {
    let td = tempfile::tempdir().unwrap();
    let base = td.path();
    assert!(locate(base, 1, 2, 3).is_none());

    let on_disk3 = touch_store(&base.join("Disk_3"), 1, 2);
    assert_eq!(locate(base, 1, 2, 3), Some(on_disk3));
    // outside the declared disk count
    assert!(locate(base, 1, 2, 2).is_none());

    let by_index = touch_store(&base.join("Disk_2"), 1, 2);
    assert_eq!(locate(base, 1, 2, 3), Some(by_index));

    let flat = touch_store(base, 1, 2);
    assert_eq!(locate(base, 1, 2, 3), Some(flat));
}

#[test]
fn trailing_disk_folder_is_stripped() {
    assert_eq!(base_dir(Path::new("/media/set/Disk_2")), PathBuf::from("/media/set"));
    assert_eq!(base_dir(Path::new("/media/set")), PathBuf::from("/media/set"));
    assert_eq!(base_dir(Path::new("/media/Disk_x")), PathBuf::from("/media/Disk_x"));
}

#[test]
fn missing_media_fails_the_whole_resolve() {
    let td = tempfile::tempdir().unwrap();
    let mut d = SkuDescriptor::new("set", Some(10), true);
    d.add_store(DEPOT, GID, 1, 0);
    d.add_store(DEPOT, GID, 2, 0);
    d.disks = 2;
    touch_store(&td.path().join("Disk_1"), DEPOT, 1);
    let err = d.resolve(td.path()).unwrap_err();
    assert!(err.to_string().contains("chunkstore 2"), "{err}");

    touch_store(&td.path().join("Disk_2"), DEPOT, 2);
    assert_eq!(d.resolve(td.path()).unwrap().len(), 2);
}

#[test]
fn restore_from_multi_disk_backup() {
    let td = tempfile::tempdir().unwrap();
    let s = common::session(&td);
    let a = common::random_bytes(1500, 1);
    let b = common::random_bytes(700, 2);
    common::put_chunk(&s, &a, true, true);
    common::put_chunk(&s, &b, true, false);

    let set = td.path().join("set");
    let store = StorePaths::in_dir(&set.join("Disk_1"), DEPOT, 1);
    let packed = pack_depot(&s, DEPOT, &store, &PackOptions::default(), &NoopObserver).unwrap();
    let mut desc = SkuDescriptor::new("my backup", Some(10), true);
    desc.add_store(DEPOT, GID, 1, packed.bytes_total);
    let sku = desc.write(&set.join("Disk_1")).unwrap();
    assert_eq!(SkuDescriptor::load(&sku).unwrap(), desc);

    let target = tempfile::tempdir().unwrap();
    let s2 = common::session(&target);
    let keep = |_: u32| -> anyhow::Result<UnpackKey> { Ok(UnpackKey::Verbatim) };
    let r = restore(&s2, &desc, sku.parent().unwrap(), &keep, &NoopObserver).unwrap();
    assert_eq!(r.manifests, vec![(DEPOT, GID)]);
    assert_eq!(r.unpacked.len(), 1);
    assert_eq!(r.unpacked[0].written, 2);
    let loose = LooseChunks::new(s2.chunk_dir(DEPOT));
    assert_eq!(loose.list().unwrap().len(), 2);
}

#[test]
fn wrapped_descriptor_loads() {
    let td = tempfile::tempdir().unwrap();
    let p = td.path().join("sku.json");
    fs::write(
        &p,
        r#"{"sku":{"name":"x","depots":[5,6],"manifests":{"5":"1","6":"2"},
            "chunkstores":{"5":{"1":"10"},"6":{"1":"20","2":"30"}},"disks":2,"encrypted":false}}"#,
    )
    .unwrap();
    // numbers quoted as strings are not accepted
    assert!(SkuDescriptor::load(&p).is_err());

    fs::write(
        &p,
        r#"{"sku":{"name":"x","depots":[5,6],"manifests":{"5":1,"6":2},
            "chunkstores":{"5":{"1":10},"6":{"1":20,"2":30}},"disks":2,"encrypted":false}}"#,
    )
    .unwrap();
    let d = SkuDescriptor::load(&p).unwrap();
    assert_eq!(d.depots, vec![5, 6]);
    assert_eq!(d.chunkstores[&6].len(), 2);
    assert_eq!(d.app_id, None);
}
