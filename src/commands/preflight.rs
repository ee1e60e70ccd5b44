//! Preflight command - runs preflight checks.

use anyhow::Result;

use crate::artifact::SyslinuxSearch;
use crate::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(strict: bool) -> Result<()> {
    let syslinux = SyslinuxSearch::default();
    if strict {
        preflight::run_preflight_or_fail(&syslinux)?;
    } else {
        let report = preflight::run_preflight(&syslinux);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to exit non-zero.");
        }
    }
    Ok(())
}
