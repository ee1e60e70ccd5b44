//! Guarded deletion inside the root tree.
//!
//! Every function here that removes files first passes through
//! [`MountManager::release`], which unmounts everything below the root and
//! then refuses with [`BuildError::ActiveMounts`] if anything is still
//! mounted. Deleting `dev/` contents through a live bind mount removes the
//! host's device nodes.

use std::fs;
use std::path::Path;

use crate::error::{BuildError, Result};
use crate::mount::{MountManager, MountTable, Mounter, UnmountReport};

use super::RootfsHandle;

/// Paths inside the root that only matter at build time.
const BUILD_ONLY_DIRS: &[&str] = &["var/cache/apk"];

impl RootfsHandle {
    /// Prepare the tree for squashing: unmount, drop caches, empty `dev/`.
    ///
    /// After this returns `root/dev` exists and is empty, ready to be
    /// repopulated by devtmpfs at boot.
    pub fn clean_for_packaging<T: MountTable, M: Mounter>(
        &self,
        mounts: &MountManager<T, M>,
    ) -> Result<UnmountReport> {
        let report = mounts.release(self.root())?;

        for rel in BUILD_ONLY_DIRS {
            let path = self.root().join(rel);
            if path.symlink_metadata().is_ok() {
                tracing::debug!(path = %path.display(), "removing build-only directory");
                remove_path(&path)?;
            }
        }

        let dev = self.root().join("dev");
        refuse_symlink(&dev)?;
        if dev.exists() {
            clear_dir_contents(&dev)?;
        } else {
            fs::create_dir(&dev)?;
        }

        Ok(report)
    }

    /// Unmount everything and remove the whole work tree.
    pub fn destroy<T: MountTable, M: Mounter>(self, mounts: &MountManager<T, M>) -> Result<()> {
        destroy_work_tree(self.work_dir(), self.root(), mounts)
    }
}

/// Remove a work tree left behind by an earlier run.
///
/// `root` is the tree whose mounts must be gone before anything is deleted;
/// for trees created by [`RootfsHandle::create`] it is `work_dir/rootfs`.
pub fn destroy_work_tree<T: MountTable, M: Mounter>(
    work_dir: &Path,
    root: &Path,
    mounts: &MountManager<T, M>,
) -> Result<()> {
    mounts.release(root)?;
    // A mount elsewhere in the work dir (not below rootfs) blocks removal too.
    mounts.ensure_unmounted(work_dir)?;

    if work_dir.exists() {
        tracing::info!(path = %work_dir.display(), "removing work tree");
        fs::remove_dir_all(work_dir)?;
    }
    Ok(())
}

/// Remove everything inside `dir`, keeping `dir` itself.
///
/// Symlinks are removed, never followed.
pub fn clear_dir_contents(dir: &Path) -> Result<()> {
    refuse_symlink(dir)?;
    for entry in fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

fn refuse_symlink(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.file_type().is_symlink() => Err(BuildError::ActiveMounts {
            root: path.to_path_buf(),
            mounts: vec![path.to_path_buf()],
        }),
        _ => Ok(()),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}
