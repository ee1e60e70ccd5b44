//! isolinux staging.
//!
//! Lays out the ISO staging directory:
//!
//! ```text
//! staging/
//!     isolinux/isolinux.bin, ldlinux.c32, [libcom32.c32 libutil.c32 menu.c32]
//!     isolinux/isolinux.cfg
//!     boot/vmlinuz-lts
//!     boot/initramfs-lts
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Where distributions install syslinux modules.
pub const SYSLINUX_DIRS: &[&str] = &[
    "/usr/lib/syslinux",
    "/usr/lib/syslinux/modules/bios",
    "/usr/lib/syslinux/bios",
    "/usr/share/syslinux",
    "/usr/lib/ISOLINUX",
];

pub const REQUIRED_FILES: &[&str] = &["isolinux.bin", "ldlinux.c32"];
/// Menu support; the image boots without them.
pub const OPTIONAL_FILES: &[&str] = &["libcom32.c32", "libutil.c32", "menu.c32"];

/// MBR image that makes the ISO bootable from USB sticks.
pub const ISOHDPFX: &str = "isohdpfx.bin";

pub const KERNEL_NAME: &str = "vmlinuz-lts";
pub const INITRAMFS_NAME: &str = crate::initramfs::INITRAMFS_NAME;

pub const ISOLINUX_CFG: &str = "\
DEFAULT linux
PROMPT 0
TIMEOUT 30

LABEL linux
    KERNEL /boot/vmlinuz-lts
    INITRD /boot/initramfs-lts
    APPEND quiet
";

/// Ordered list of directories searched for syslinux files.
#[derive(Debug, Clone)]
pub struct SyslinuxSearch {
    dirs: Vec<PathBuf>,
}

impl Default for SyslinuxSearch {
    fn default() -> Self {
        Self {
            dirs: SYSLINUX_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl SyslinuxSearch {
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dirs: dirs.into_iter().collect(),
        }
    }

    pub fn find(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    pub fn isohdpfx(&self) -> Option<PathBuf> {
        self.find(ISOHDPFX)
    }

    fn describe(&self) -> String {
        self.dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Find `name` in `boot_dir`, falling back to the first `name*` entry.
pub fn find_boot_file(boot_dir: &Path, name: &str) -> Result<PathBuf> {
    let exact = boot_dir.join(name);
    if exact.is_file() {
        return Ok(exact);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(boot_dir)
        .with_context(|| format!("reading {}", boot_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|f| f.to_string_lossy())
                    .is_some_and(|f| f.starts_with(name) && !f.ends_with(".tmp"))
        })
        .collect();
    candidates.sort();

    match candidates.into_iter().next() {
        Some(path) => Ok(path),
        None => bail!("{} not found in {}", name, boot_dir.display()),
    }
}

/// Copy bootloader, kernel and initramfs into `staging`.
pub fn stage_bootloader(root: &Path, staging: &Path, syslinux: &SyslinuxSearch) -> Result<()> {
    let isolinux_dir = staging.join("isolinux");
    let boot_dir = staging.join("boot");
    fs::create_dir_all(&isolinux_dir)
        .with_context(|| format!("creating {}", isolinux_dir.display()))?;
    fs::create_dir_all(&boot_dir).with_context(|| format!("creating {}", boot_dir.display()))?;

    for name in REQUIRED_FILES {
        let Some(src) = syslinux.find(name) else {
            bail!(
                "required syslinux file not found: {} (searched: {})",
                name,
                syslinux.describe()
            );
        };
        fs::copy(&src, isolinux_dir.join(name))
            .with_context(|| format!("copying {}", src.display()))?;
    }

    for name in OPTIONAL_FILES {
        match syslinux.find(name) {
            Some(src) => {
                if let Err(e) = fs::copy(&src, isolinux_dir.join(name)) {
                    println!("  [WARN] Could not copy {}: {}", src.display(), e);
                }
            }
            None => tracing::debug!(file = name, "optional syslinux module not found"),
        }
    }

    let root_boot = root.join("boot");
    for name in [KERNEL_NAME, INITRAMFS_NAME] {
        let src = find_boot_file(&root_boot, name)?;
        fs::copy(&src, boot_dir.join(name))
            .with_context(|| format!("copying {}", src.display()))?;
        println!("  Staged boot/{} (from {})", name, src.display());
    }

    fs::write(isolinux_dir.join("isolinux.cfg"), ISOLINUX_CFG)
        .context("writing isolinux.cfg")?;

    Ok(())
}
