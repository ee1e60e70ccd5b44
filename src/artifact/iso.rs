//! Squashfs and ISO assembly.
//!
//! The root tree is compressed into `staging/rootfs.squashfs` (the live
//! init looks for it at the top of the media), then xorriso builds an El
//! Torito isolinux image from the staging directory. The ISO is written to
//! a temporary name and renamed into place on success.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::initramfs::init::SQUASHFS_IMAGE;
use crate::process::Cmd;

use super::bootloader::SyslinuxSearch;

/// Compress `root` into a read-only squashfs image.
pub fn create_squashfs(root: &Path, output: &Path) -> Result<()> {
    println!("  Creating squashfs image...");

    if output.exists() {
        fs::remove_file(output)?;
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    Cmd::new("mksquashfs")
        .arg_path(root)
        .arg_path(output)
        .args(["-comp", "xz"])
        .arg("-no-xattrs")
        .arg("-noappend")
        .error_msg("mksquashfs failed. Install squashfs-tools")
        .run_interactive()?;

    print_size("Squashfs", output);
    Ok(())
}

/// Arguments for `xorriso -as mkisofs`.
pub fn xorriso_args(staging: &Path, output: &Path, isohdpfx: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "-as".to_string(),
        "mkisofs".to_string(),
        "-o".to_string(),
        output.to_string_lossy().into_owned(),
    ];
    args.extend(
        [
            "-b",
            "isolinux/isolinux.bin",
            "-c",
            "isolinux/boot.cat",
            "-no-emul-boot",
            "-boot-load-size",
            "4",
            "-boot-info-table",
        ]
        .map(String::from),
    );
    if let Some(mbr) = isohdpfx {
        args.push("-isohybrid-mbr".to_string());
        args.push(mbr.to_string_lossy().into_owned());
    }
    args.push(staging.to_string_lossy().into_owned());
    args
}

/// Squash `root` into `staging` and write the bootable ISO to `output`.
pub fn create_iso(
    root: &Path,
    staging: &Path,
    output: &Path,
    syslinux: &SyslinuxSearch,
) -> Result<()> {
    create_squashfs(root, &staging.join(SQUASHFS_IMAGE))?;

    println!("  Building ISO image...");
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let isohdpfx = syslinux.isohdpfx();
    if isohdpfx.is_none() {
        println!(
            "  [WARN] {} not found, ISO will not be USB-bootable",
            super::bootloader::ISOHDPFX
        );
    }

    let temp = temp_iso_path(output);
    let result = Cmd::new("xorriso")
        .args(xorriso_args(staging, &temp, isohdpfx.as_deref()))
        .error_msg("xorriso failed")
        .run_interactive();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }

    fs::rename(&temp, output)
        .with_context(|| format!("moving ISO into place at {}", output.display()))?;
    print_size("ISO", output);
    Ok(())
}

fn temp_iso_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    output.with_file_name(name)
}

fn print_size(label: &str, path: &Path) {
    match fs::metadata(path) {
        Ok(meta) => println!(
            "  {} size: {:.1} MB",
            label,
            meta.len() as f64 / 1024.0 / 1024.0
        ),
        Err(e) => println!("  [WARN] Could not read {} size: {}", label, e),
    }
}
