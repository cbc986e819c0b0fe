use crate::chunkstore::StorePaths;
use crate::pack::{unpack_chunkstore, UnpackKey, UnpackReport};
use crate::session::{Observer, Session};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DESCRIPTOR_NAME: &str = "sku.json";

/// Describes the manifests and chunkstores that make up one backup set.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SkuDescriptor {
    pub name: String,
    #[serde(default)]
    pub app_id: Option<u32>,
    /// Depots in pack order.
    pub depots: Vec<u32>,
    /// Depot -> manifest gid to extract after restoring.
    pub manifests: BTreeMap<u32, u64>,
    /// Depot -> chunkstore index -> blob size.
    pub chunkstores: BTreeMap<u32, BTreeMap<u32, u64>>,
    pub disks: u32,
    /// Whether the stores hold encrypted payloads.
    pub encrypted: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    Wrapped { sku: SkuDescriptor },
    Bare(SkuDescriptor),
}

impl SkuDescriptor {
    pub fn new(name: impl Into<String>, app_id: Option<u32>, encrypted: bool) -> Self {
        Self {
            name: name.into(),
            app_id,
            depots: Vec::new(),
            manifests: BTreeMap::new(),
            chunkstores: BTreeMap::new(),
            disks: 1,
            encrypted,
        }
    }

    pub fn add_store(&mut self, depot: u32, manifest: u64, index: u32, blob_size: u64) {
        if !self.depots.contains(&depot) {
            self.depots.push(depot);
        }
        self.manifests.insert(depot, manifest);
        self.chunkstores.entry(depot).or_default().insert(index, blob_size);
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let parsed: DescriptorFile = serde_json::from_reader(std::io::BufReader::new(f))
            .with_context(|| format!("parse backup descriptor {:?}", path))?;
        Ok(match parsed {
            DescriptorFile::Wrapped { sku } => sku,
            DescriptorFile::Bare(sku) => sku,
        })
    }

    /// Write `sku.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DESCRIPTOR_NAME);
        serde_json::to_writer_pretty(File::create(&path)?, self)?;
        Ok(path)
    }

    /// Locate every chunkstore; any missing one fails the whole resolve.
    pub fn resolve(&self, base: &Path) -> Result<Vec<(u32, u32, StorePaths)>> {
        let mut found = Vec::new();
        for depot in self.ordered_depots() {
            let Some(indices) = self.chunkstores.get(&depot) else { continue };
            for &index in indices.keys() {
                match locate(base, depot, index, self.disks) {
                    Some(p) => found.push((depot, index, p)),
                    None => bail!(
                        "chunkstore {index} of depot {depot} not found under {} (missing disk?)",
                        base.display()
                    ),
                }
            }
        }
        Ok(found)
    }

    /// `depots` order first, then any depot only listed under `chunkstores`.
    fn ordered_depots(&self) -> Vec<u32> {
        let mut v = self.depots.clone();
        v.extend(self.chunkstores.keys().filter(|d| !self.depots.contains(d)));
        v
    }
}

/// Drop a trailing `Disk_<n>` component so searches start at the set root.
pub fn base_dir(dir: &Path) -> PathBuf {
    let is_disk = dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("Disk_"))
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    match (is_disk, dir.parent()) {
        (true, Some(p)) => p.to_path_buf(),
        _ => dir.to_path_buf(),
    }
}

/// Flat next to the descriptor, then `Disk_<index>`, then `Disk_1..=disks`.
pub fn locate(base: &Path, depot: u32, index: u32, disks: u32) -> Option<StorePaths> {
    std::iter::once(base.to_path_buf())
        .chain(std::iter::once(base.join(format!("Disk_{index}"))))
        .chain((1..=disks).map(|d| base.join(format!("Disk_{d}"))))
        .map(|dir| StorePaths::in_dir(&dir, depot, index))
        .find(|p| {
            log::debug!("looking for {}", p.csm.display());
            p.exists()
        })
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub unpacked: Vec<UnpackReport>,
    /// `(depot, manifest)` pairs still to run through extraction.
    pub manifests: Vec<(u32, u64)>,
}

/// Resolve every store of `desc` under `descriptor_dir`, then unpack them all.
pub fn restore(
    session: &Session,
    desc: &SkuDescriptor,
    descriptor_dir: &Path,
    key_for: &dyn Fn(u32) -> Result<UnpackKey>,
    observer: &dyn Observer,
) -> Result<RestoreReport> {
    let base = base_dir(descriptor_dir);
    let stores = desc.resolve(&base)?;
    log::info!("backup {:?}: {} chunkstores under {}", desc.name, stores.len(), base.display());
    let mut report = RestoreReport::default();
    for (depot, index, paths) in stores {
        if session.is_cancelled() {
            break;
        }
        log::info!("unpacking chunkstore {index} of depot {depot}");
        let key = key_for(depot)?;
        report.unpacked.push(unpack_chunkstore(session, &paths.csm, &key, observer)?);
    }
    report.manifests = desc
        .ordered_depots()
        .into_iter()
        .filter_map(|d| desc.manifests.get(&d).map(|m| (d, *m)))
        .collect();
    Ok(report)
}
