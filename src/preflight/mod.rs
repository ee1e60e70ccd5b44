//! Preflight checks for an alpiso build.
//!
//! Validates privileges and host tools before starting a build.
//! Run with `alpiso preflight` to check everything is ready.

mod host_tools;
mod types;

use anyhow::{bail, Result};

use crate::artifact::SyslinuxSearch;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(syslinux: &SyslinuxSearch) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking privileges...");
    checks.push(host_tools::check_root());

    println!("Checking host tools...");
    checks.extend(host_tools::check_host_tools());

    println!("Checking bootloader files...");
    checks.push(host_tools::check_isohdpfx(syslinux));

    println!();

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(syslinux: &SyslinuxSearch) -> Result<()> {
    let report = run_preflight(syslinux);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
