//! Mount lifecycle for the chroot under construction.
//!
//! Mounts are never cached: every query goes to the live mount table through
//! the [`MountTable`] capability, and every mount/unmount goes through the
//! [`Mounter`] capability. Production uses `/proc/self/mounts` and the host
//! `mount`/`umount` binaries; tests substitute a simulated table.
//!
//! Teardown is best-effort: [`MountManager::unmount_all`] never fails, it
//! reports what it could not unmount. Anything that deletes files under the
//! root must call [`MountManager::ensure_unmounted`] afterwards, which fails
//! while any mount is still live below the root. A recursive delete through a
//! still-active `/dev` bind mount removes the host's device nodes.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::process::{Cmd, CmdError};

/// Filesystem types that are kernel-provided rather than backed by a host path.
const VIRTUAL_FSTYPES: &[&str] = &[
    "proc",
    "sysfs",
    "devtmpfs",
    "devpts",
    "tmpfs",
    "cgroup",
    "cgroup2",
    "securityfs",
    "debugfs",
    "tracefs",
    "mqueue",
    "hugetlbfs",
    "efivarfs",
    "pstore",
    "bpf",
    "configfs",
    "fusectl",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Virtual,
}

/// One live mount, as read from the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub mount_point: PathBuf,
    pub kind: MountKind,
}

impl MountRecord {
    pub fn new(mount_point: impl Into<PathBuf>, kind: MountKind) -> Self {
        Self {
            mount_point: mount_point.into(),
            kind,
        }
    }
}

/// Virtual filesystems the chroot needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualFs {
    /// Process information (`/proc`).
    Proc,
    /// System information (`/sys`).
    Sysfs,
    /// Kernel-managed device nodes (`/dev`).
    Devtmpfs,
}

impl VirtualFs {
    pub fn fstype(&self) -> &'static str {
        match self {
            VirtualFs::Proc => "proc",
            VirtualFs::Sysfs => "sysfs",
            VirtualFs::Devtmpfs => "devtmpfs",
        }
    }
}

/// Read access to the live mount table.
pub trait MountTable {
    fn mounts(&self) -> std::io::Result<Vec<MountRecord>>;
}

/// Privileged mount operations.
pub trait Mounter {
    fn mount_virtual(&self, fs: VirtualFs, target: &Path) -> std::result::Result<(), CmdError>;
    fn bind(&self, source: &Path, target: &Path) -> std::result::Result<(), CmdError>;
    fn unmount(&self, target: &Path) -> std::result::Result<(), CmdError>;
}

impl<T: MountTable + ?Sized> MountTable for &T {
    fn mounts(&self) -> std::io::Result<Vec<MountRecord>> {
        (**self).mounts()
    }
}

impl<M: Mounter + ?Sized> Mounter for &M {
    fn mount_virtual(&self, fs: VirtualFs, target: &Path) -> std::result::Result<(), CmdError> {
        (**self).mount_virtual(fs, target)
    }

    fn bind(&self, source: &Path, target: &Path) -> std::result::Result<(), CmdError> {
        (**self).bind(source, target)
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), CmdError> {
        (**self).unmount(target)
    }
}

/// The kernel's view of this process's mounts.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl ProcMounts {
    /// Read a mounts file at a non-standard location.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MountTable for ProcMounts {
    fn mounts(&self) -> std::io::Result<Vec<MountRecord>> {
        let content = fs::read_to_string(&self.path)?;
        Ok(parse_mounts(&content))
    }
}

/// Parse `/proc/mounts` format: `device mountpoint fstype options dump pass`.
pub fn parse_mounts(content: &str) -> Vec<MountRecord> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            let kind = if VIRTUAL_FSTYPES.contains(&fstype) {
                MountKind::Virtual
            } else {
                MountKind::Bind
            };
            Some(MountRecord::new(unescape_mount_path(mount_point), kind))
        })
        .collect()
}

/// Decode the octal escapes (`\040` for space, etc.) the kernel uses in mount paths.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Runs the host `mount`/`umount` binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount_virtual(&self, fs: VirtualFs, target: &Path) -> std::result::Result<(), CmdError> {
        Cmd::new("mount")
            .args(["-t", fs.fstype(), fs.fstype()])
            .arg_path(target)
            .run()?;
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path) -> std::result::Result<(), CmdError> {
        Cmd::new("mount")
            .arg("--bind")
            .arg_path(source)
            .arg_path(target)
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> std::result::Result<(), CmdError> {
        Cmd::new("umount").arg_path(target).run()?;
        Ok(())
    }
}

/// Outcome of a best-effort teardown.
#[derive(Debug, Default)]
pub struct UnmountReport {
    /// Mount points unmounted, in the order they were processed.
    pub unmounted: Vec<PathBuf>,
    /// Recoverable failures ([`BuildError::Unmount`]).
    pub failures: Vec<BuildError>,
}

impl UnmountReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Establishes and tears down the mounts of one root tree.
pub struct MountManager<T, M> {
    table: T,
    mounter: M,
}

impl MountManager<ProcMounts, SystemMounter> {
    /// Manager backed by the live OS mount table and host mount tools.
    pub fn system() -> Self {
        Self::new(ProcMounts::default(), SystemMounter)
    }
}

impl<T: MountTable, M: Mounter> MountManager<T, M> {
    pub fn new(table: T, mounter: M) -> Self {
        Self { table, mounter }
    }

    /// Create `target` and mount a virtual filesystem on it.
    pub fn mount_virtual(&self, fs: VirtualFs, target: &Path) -> Result<()> {
        fs::create_dir_all(target)
            .map_err(|e| BuildError::mount(target, format!("creating mount point: {}", e)))?;
        self.mounter
            .mount_virtual(fs, target)
            .map_err(|e| BuildError::mount(target, e))?;
        tracing::debug!(target = %target.display(), fstype = fs.fstype(), "mounted");
        Ok(())
    }

    /// Create `target` and bind-mount the host path `source` on it.
    pub fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        fs::create_dir_all(target)
            .map_err(|e| BuildError::mount(target, format!("creating mount point: {}", e)))?;
        self.mounter
            .bind(source, target)
            .map_err(|e| BuildError::mount(target, e))?;
        tracing::debug!(source = %source.display(), target = %target.display(), "bind mounted");
        Ok(())
    }

    /// Live mounts strictly below `root`, deepest first.
    ///
    /// Ordering is by path length, descending; ties keep mount-table order.
    pub fn mounts_under(&self, root: &Path) -> Result<Vec<MountRecord>> {
        let mut found: Vec<MountRecord> = self
            .table
            .mounts()?
            .into_iter()
            .filter(|m| m.mount_point != root && m.mount_point.starts_with(root))
            .collect();
        found.sort_by_key(|m| std::cmp::Reverse(m.mount_point.as_os_str().len()));
        Ok(found)
    }

    /// Unmount everything below `root`, children before parents.
    ///
    /// Never fails. Each failure is logged as a warning and returned in the
    /// report; with nothing mounted below `root` this does nothing.
    pub fn unmount_all(&self, root: &Path) -> UnmountReport {
        let mut report = UnmountReport::default();

        let mounts = match self.mounts_under(root) {
            Ok(mounts) => mounts,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "cannot read mount table");
                report.failures.push(BuildError::Unmount {
                    target: root.to_path_buf(),
                    reason: format!("reading mount table: {}", e),
                });
                return report;
            }
        };

        for record in mounts {
            match self.mounter.unmount(&record.mount_point) {
                Ok(()) => {
                    tracing::debug!(target = %record.mount_point.display(), "unmounted");
                    report.unmounted.push(record.mount_point);
                }
                Err(e) => {
                    tracing::warn!(
                        target = %record.mount_point.display(),
                        error = %e,
                        "failed to unmount"
                    );
                    report.failures.push(BuildError::Unmount {
                        target: record.mount_point,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Fail with [`BuildError::ActiveMounts`] while anything is mounted below `root`.
    pub fn ensure_unmounted(&self, root: &Path) -> Result<()> {
        let remaining = self.mounts_under(root)?;
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(BuildError::ActiveMounts {
                root: root.to_path_buf(),
                mounts: remaining.into_iter().map(|m| m.mount_point).collect(),
            })
        }
    }

    /// Tear down every mount below `root` and prove nothing is left.
    ///
    /// This is the gate every destructive operation under the root passes.
    pub fn release(&self, root: &Path) -> Result<UnmountReport> {
        let report = self.unmount_all(root);
        self.ensure_unmounted(root)?;
        Ok(report)
    }
}
