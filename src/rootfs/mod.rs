//! Alpine root filesystem assembly.
//!
//! A [`RootfsHandle`] owns one work tree for the duration of a build:
//!
//! ```text
//! <work_root>/alpiso-<name>-<pid>-<secs>/
//!     minirootfs.tar.gz     downloaded base artifact
//!     rootfs/               the tree that becomes the live system
//!     initramfs-work/       scratch space for the initramfs transcoder
//!     staging/              ISO staging (bootloader + squashfs)
//! ```
//!
//! - [`bootstrap`] - ordered discover/download/extract/mount/provision pipeline
//! - [`download`] - release index discovery, artifact download, tarball extraction
//! - [`provision`] - apk, users and OpenRC services inside the chroot
//! - [`kernel`] - mkinitfs configuration and kernel version discovery
//! - [`cleanup`] - guarded deletion (always after unmounting)

pub mod bootstrap;
pub mod cleanup;
pub mod download;
pub mod kernel;
pub mod provision;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{BuildError, Result};
use crate::mount::{MountManager, MountRecord, MountTable, Mounter};

pub use bootstrap::{Bootstrapper, BootstrapReport};
pub use cleanup::clear_dir_contents;

/// Prefix of every work directory this tool creates.
pub const WORK_DIR_PREFIX: &str = "alpiso-";

/// Exclusive owner of one build's work tree.
#[derive(Debug)]
pub struct RootfsHandle {
    root: PathBuf,
    work_dir: PathBuf,
    arch: String,
}

impl RootfsHandle {
    /// Create a fresh, uniquely named work tree under `work_root`.
    ///
    /// The directory name carries the process id and a timestamp, and is
    /// created non-recursively, so two builds never share a tree.
    pub fn create(work_root: &Path, name: &str, arch: &str) -> Result<Self> {
        fs::create_dir_all(work_root)?;
        let work_root = fs::canonicalize(work_root)?;

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let work_dir = work_root.join(format!(
            "{}{}-{}-{}",
            WORK_DIR_PREFIX,
            name,
            std::process::id(),
            secs
        ));

        fs::create_dir(&work_dir).map_err(|e| {
            BuildError::Config(format!(
                "cannot create work directory {}: {}",
                work_dir.display(),
                e
            ))
        })?;

        let root = work_dir.join("rootfs");
        fs::create_dir(&root)?;

        Ok(Self {
            root,
            work_dir,
            arch: arch.to_string(),
        })
    }

    /// Adopt an existing work tree (e.g. one left behind by an interrupted run).
    pub fn adopt(work_dir: &Path, arch: &str) -> Result<Self> {
        let work_dir = fs::canonicalize(work_dir)?;
        Ok(Self {
            root: work_dir.join("rootfs"),
            work_dir,
            arch: arch.to_string(),
        })
    }

    /// Absolute path of the root tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.root.join("boot")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staging")
    }

    /// Mounts currently live below the root, read fresh from the mount table.
    pub fn discovered_mounts<T: MountTable, M: Mounter>(
        &self,
        mounts: &MountManager<T, M>,
    ) -> Result<Vec<MountRecord>> {
        mounts.mounts_under(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_layout() {
        let temp = TempDir::new().unwrap();
        let handle = RootfsHandle::create(temp.path(), "demo", "x86_64").unwrap();

        assert!(handle.root().is_absolute());
        assert!(handle.root().is_dir());
        assert_eq!(handle.root(), handle.work_dir().join("rootfs"));
        assert_eq!(handle.boot_dir(), handle.root().join("boot"));
        assert_eq!(handle.arch(), "x86_64");

        let dir_name = handle.work_dir().file_name().unwrap().to_string_lossy();
        assert!(dir_name.starts_with("alpiso-demo-"));
    }

    #[test]
    fn test_create_never_reuses_existing_dir() {
        let temp = TempDir::new().unwrap();
        let first = RootfsHandle::create(temp.path(), "demo", "x86_64").unwrap();
        fs::write(first.root().join("marker"), "first").unwrap();

        // Same pid and (very likely) same second: must not land in the same tree.
        match RootfsHandle::create(temp.path(), "demo", "x86_64") {
            Ok(second) => assert_ne!(first.work_dir(), second.work_dir()),
            Err(e) => assert!(e.to_string().contains("cannot create work directory")),
        }
        assert_eq!(
            fs::read_to_string(first.root().join("marker")).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_adopt_existing() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("old/rootfs")).unwrap();
        let handle = RootfsHandle::adopt(&temp.path().join("old"), "aarch64").unwrap();
        assert!(handle.root().ends_with("old/rootfs"));
    }
}
