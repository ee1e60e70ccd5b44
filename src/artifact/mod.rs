//! Build artifacts - bootloader staging and ISO assembly.
//!
//! - `bootloader` - isolinux files, kernel and initramfs into the staging dir
//! - `iso` - squashfs of the root tree plus the bootable ISO

pub mod bootloader;
pub mod iso;

pub use bootloader::{stage_bootloader, SyslinuxSearch};
pub use iso::{create_iso, create_squashfs};
