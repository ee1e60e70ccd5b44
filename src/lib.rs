//! alpiso library.
//!
//! The build core (`mount`, `rootfs`, `initramfs`, `sbom`) returns
//! [`error::BuildError`]; `artifact`, `preflight` and `commands` sit on top
//! with `anyhow`.

pub mod artifact;
pub mod commands;
pub mod config;
pub mod error;
pub mod initramfs;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod rootfs;
pub mod sbom;
pub mod timing;
