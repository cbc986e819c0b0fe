use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Bounded retry for open/truncate calls that can hit transient permission errors
/// (scanners and indexers holding a handle on freshly created files).
#[derive(Clone, Copy, Debug)]
pub struct FsRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for FsRetry {
    fn default() -> Self {
        Self { attempts: 5, backoff: Duration::from_secs(1) }
    }
}

impl FsRetry {
    pub fn run<T>(&self, what: &Path, mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied && attempt < self.attempts => {
                    log::warn!(
                        "{}: {} (attempt {}/{}), retrying in {:?}",
                        what.display(),
                        e,
                        attempt,
                        self.attempts,
                        self.backoff
                    );
                    thread::sleep(self.backoff);
                    attempt += 1;
                }
                r => return r.with_context(|| format!("{:?}", what)),
            }
        }
    }

    /// Open (creating if needed, never truncating) and size `path` to exactly `size`.
    pub fn preallocate(&self, path: &Path, size: u64) -> Result<File> {
        self.run(path, || {
            let f = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
            f.set_len(size)?;
            Ok(f)
        })
    }
}

pub fn part_path(path: &Path) -> PathBuf {
    with_suffix(path, ".part")
}

/// Write `bytes` to a `.part` sibling and rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = part_path(path);
    {
        let mut f = File::create(&tmp).with_context(|| format!("create {:?}", tmp))?;
        f.write_all(bytes)?;
        f.sync_data()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))
}

/// `<path><suffix>` without touching the existing extension.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}
