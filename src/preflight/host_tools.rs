//! Host tool and privilege checks.

use nix::unistd::Uid;

use crate::artifact::SyslinuxSearch;
use crate::process;

use super::types::CheckResult;

/// Tools the build shells out to: (tool, package, purpose).
pub const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("xorriso", "xorriso", "Required to create ISO image"),
    ("mksquashfs", "squashfs-tools", "Required to create squashfs filesystem"),
    ("chroot", "coreutils", "Required to run apk inside the new root"),
    ("mount", "util-linux", "Required to mount /proc, /sys and /dev"),
    ("umount", "util-linux", "Required to release mounts before cleanup"),
];

/// Mounting and chroot need root.
pub fn check_root() -> CheckResult {
    check_root_for(Uid::effective())
}

fn check_root_for(uid: Uid) -> CheckResult {
    if uid.is_root() {
        CheckResult::pass("root privileges")
    } else {
        CheckResult::fail(
            "root privileges",
            &format!("running as uid {}. Re-run with sudo", uid),
        )
    }
}

/// Check host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    REQUIRED_TOOLS
        .iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose))
        .collect()
}

/// A missing hybrid MBR only costs USB bootability.
pub fn check_isohdpfx(syslinux: &SyslinuxSearch) -> CheckResult {
    match syslinux.isohdpfx() {
        Some(path) => CheckResult::pass_with("isohdpfx.bin", &path.display().to_string()),
        None => CheckResult::warn(
            "isohdpfx.bin",
            "Not found - ISO will boot from optical media only. Install 'syslinux'.",
        ),
    }
}

fn check_tool_exists(tool: &str, package: &str, purpose: &str) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => CheckResult::fail(
            tool,
            &format!("Not found. Install '{}' package. {}", package, purpose),
        ),
    }
}
