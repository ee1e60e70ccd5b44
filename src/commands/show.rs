//! Show command - displays information.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::{BuildConfig, Settings};
use crate::initramfs::init::InitScript;

/// Show target for the show command.
pub enum ShowTarget {
    /// Validate and print a build file plus the environment settings
    Config { file: PathBuf },
    /// Print the live boot init script
    Init,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget) -> Result<()> {
    match target {
        ShowTarget::Config { file } => {
            let config = BuildConfig::load(&file)
                .with_context(|| format!("loading {}", file.display()))?;
            config.print();
            println!();
            Settings::load().print();
        }
        ShowTarget::Init => {
            print!("{}", InitScript::get().as_str());
        }
    }
    Ok(())
}
