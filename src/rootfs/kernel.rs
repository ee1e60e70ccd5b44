//! Kernel discovery and initramfs generation inside the root.

use std::fs;
use std::path::Path;

use crate::error::{BuildError, Result};
use crate::process::RootRunner;

/// mkinitfs features needed to boot from optical media, USB and virtual disks.
pub const MKINITFS_FEATURES: &[&str] = &[
    "ata", "base", "cdrom", "scsi", "squashfs", "usb", "virtio", "loop",
];

/// Release channel marker in kernel module directory names (`6.6.14-0-lts`).
pub const KERNEL_CHANNEL: &str = "lts";

/// Write `etc/mkinitfs/mkinitfs.conf` with the live-boot feature set.
pub fn configure_mkinitfs(root: &Path) -> Result<()> {
    let dir = root.join("etc/mkinitfs");
    fs::create_dir_all(&dir)?;
    let content = format!("features=\"{}\"\n", MKINITFS_FEATURES.join(" "));
    fs::write(dir.join("mkinitfs.conf"), content)?;
    Ok(())
}

/// Find the installed kernel's version from `lib/modules`.
///
/// Entries are examined in sorted order; the first one naming the release
/// channel wins, otherwise the first entry.
pub fn find_kernel_version(root: &Path) -> Result<String> {
    let modules = root.join("lib/modules");
    let mut versions: Vec<String> = fs::read_dir(&modules)
        .map_err(|e| {
            BuildError::Config(format!(
                "cannot read kernel modules directory {}: {}",
                modules.display(),
                e
            ))
        })?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    versions.sort();

    versions
        .iter()
        .find(|v| v.contains(KERNEL_CHANNEL))
        .or_else(|| versions.first())
        .cloned()
        .ok_or_else(|| {
            BuildError::Config(format!("no kernel found in {}", modules.display()))
        })
}

/// Run `mkinitfs <version>` inside the root.
pub fn generate_initramfs(runner: &dyn RootRunner, root: &Path, version: &str) -> Result<()> {
    runner
        .run_in_root(root, "mkinitfs", &[version])
        .map_err(|e| BuildError::provisioning(format!("mkinitfs {}", version), e))?;
    Ok(())
}
