//! Clean command - removes a work tree left behind by an interrupted build.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::mount::MountManager;
use crate::rootfs::{RootfsHandle, WORK_DIR_PREFIX};

/// Resolve `path` (a work dir or its `rootfs/`) to a handle on that tree.
///
/// Only directories named like the ones `alpiso build` creates are accepted.
pub fn resolve_work_tree(path: &Path) -> Result<RootfsHandle> {
    let path = fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))?;
    let work_dir = if path.file_name().is_some_and(|n| n == "rootfs") {
        path.parent().map(Path::to_path_buf).unwrap_or(path)
    } else {
        path
    };

    let is_work_tree = work_dir
        .file_name()
        .map(|n| n.to_string_lossy().starts_with(WORK_DIR_PREFIX))
        .unwrap_or(false);
    if !is_work_tree {
        bail!(
            "{} is not an alpiso work tree (expected a directory named {}*)",
            work_dir.display(),
            WORK_DIR_PREFIX
        );
    }

    let handle = RootfsHandle::adopt(&work_dir, std::env::consts::ARCH)?;
    Ok(handle)
}

/// Execute the clean command.
pub fn cmd_clean(path: &Path) -> Result<()> {
    let handle = resolve_work_tree(path)?;
    let work_dir = handle.work_dir().to_path_buf();
    let mounts = MountManager::system();

    println!("Unmounting everything below {}...", handle.root().display());
    let report = mounts.unmount_all(handle.root());
    for target in &report.unmounted {
        println!("  Unmounted {}", target.display());
    }
    for failure in &report.failures {
        println!("  [WARN] {}", failure);
    }

    println!("Removing {}...", work_dir.display());
    handle
        .destroy(&mounts)
        .with_context(|| format!("removing {}", work_dir.display()))?;
    println!("Cleaned.");
    Ok(())
}
