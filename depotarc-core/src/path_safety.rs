use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

/// Ensure a manifest-relative path stays under `root`: no absolute paths, no `..`,
/// and unless `follow_symlinks` is set, no symlinked component on the way down.
pub fn validate_path(root: &Path, rel: &Path, policy: PathPolicy) -> Result<PathBuf> {
    if rel.is_absolute() || rel.has_root() {
        bail!("absolute paths are not allowed: {:?}", rel);
    }
    for comp in rel.components() {
        match comp {
            Component::ParentDir => bail!("parent traversal not allowed: {:?}", rel),
            Component::Prefix(_) => bail!("path prefix not allowed: {:?}", rel),
            _ => {}
        }
    }
    let candidate = root.join(rel);
    if !policy.follow_symlinks {
        let mut cur = root.to_path_buf();
        for comp in rel.components() {
            cur = cur.join(comp);
            if let Ok(m) = fs::symlink_metadata(&cur) {
                if m.file_type().is_symlink() {
                    bail!("symlink in path (not following): {:?}", cur);
                }
            }
        }
    }
    Ok(candidate)
}

/// Create `dir` (under `root`) as a directory chain. Any component that already exists
/// as a plain file is removed and replaced; this happens with archives produced on
/// case-insensitive filesystems. Returns the paths that were replaced.
pub fn ensure_dir_chain(root: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let mut replaced = Vec::new();
    let mut cur = root.to_path_buf();
    for comp in rel.components() {
        cur.push(comp);
        match fs::symlink_metadata(&cur) {
            Ok(m) if m.is_dir() => continue,
            Ok(_) => {
                log::warn!("replacing file {} with a directory", cur.display());
                fs::remove_file(&cur).with_context(|| format!("remove {:?}", cur))?;
                replaced.push(cur.clone());
            }
            Err(_) => {}
        }
        fs::create_dir(&cur)
            .or_else(|e| if cur.is_dir() { Ok(()) } else { Err(e) })
            .with_context(|| format!("create dir {:?}", cur))?;
    }
    Ok(replaced)
}
