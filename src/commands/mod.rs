//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build a live ISO from a build file
//! - `clean` - Remove a leftover work tree
//! - `show` - Display information
//! - `preflight` - Run preflight checks

pub mod build;
pub mod clean;
mod preflight;
pub mod show;

pub use build::{cmd_build, BuildArgs};
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use show::{cmd_show, ShowTarget};
