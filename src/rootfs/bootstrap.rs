//! Ordered rootfs bootstrap.
//!
//! ```text
//! resolve arch → discover → download → extract → mount → copy resolv.conf
//!   → install base → configure mkinitfs → kernel version → mkinitfs → patch
//! ```
//!
//! The pipeline is fail-fast: the first failing stage aborts the bootstrap
//! with an error tagged by [`Stage`]. Nothing is retried. Mounts made before
//! a failure stay in place; the caller tears them down through
//! [`RootfsHandle::destroy`] or [`MountManager::unmount_all`].

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{alpine_arch, BuildConfig, Settings};
use crate::error::{BuildError, Result, Stage, StageExt};
use crate::initramfs::{locate_initramfs, InitramfsTranscoder, PatchReport};
use crate::mount::{MountManager, MountTable, Mounter, VirtualFs};
use crate::process::RootRunner;

use super::download::{extract_tarball, ReleaseClient, ReleaseRecord};
use super::kernel::{configure_mkinitfs, find_kernel_version, generate_initramfs};
use super::provision::{self, Apk};
use super::RootfsHandle;

/// Packages every live image needs to boot: kernel, init system, fs tools.
pub const BASE_PACKAGES: &[&str] = &[
    "alpine-base",
    "linux-lts",
    "linux-firmware-none",
    "mkinitfs",
    "openrc",
    "e2fsprogs",
];

/// Mount points that must be live inside the root before anything runs there.
const CHROOT_MOUNTS: &[&str] = &["proc", "sys", "dev"];

/// Architectures Alpine publishes release artifacts for.
pub const SUPPORTED_ARCHES: &[&str] = &[
    "x86_64",
    "x86",
    "aarch64",
    "armv7",
    "armhf",
    "ppc64le",
    "s390x",
    "riscv64",
    "loongarch64",
];

/// Map an architecture name (host or user supplied) to Alpine's naming.
pub fn resolve_arch(requested: &str) -> Result<String> {
    let arch = alpine_arch(requested.trim());
    if SUPPORTED_ARCHES.contains(&arch) {
        Ok(arch.to_string())
    } else {
        Err(BuildError::Config(format!(
            "unsupported architecture {:?} (supported: {})",
            requested,
            SUPPORTED_ARCHES.join(", ")
        )))
    }
}

/// What a finished bootstrap produced.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub release: ReleaseRecord,
    pub kernel_version: String,
    pub initramfs: PathBuf,
    pub patch: PatchReport,
}

/// Drives the bootstrap pipeline for one root.
pub struct Bootstrapper<'a, T, M> {
    settings: &'a Settings,
    mounts: &'a MountManager<T, M>,
    runner: &'a dyn RootRunner,
    host_resolv: PathBuf,
    host_dev: PathBuf,
}

impl<'a, T: MountTable, M: Mounter> Bootstrapper<'a, T, M> {
    pub fn new(
        settings: &'a Settings,
        mounts: &'a MountManager<T, M>,
        runner: &'a dyn RootRunner,
    ) -> Self {
        Self {
            settings,
            mounts,
            runner,
            host_resolv: PathBuf::from("/etc/resolv.conf"),
            host_dev: PathBuf::from("/dev"),
        }
    }

    /// Use a different host DNS configuration file.
    pub fn with_host_resolv(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_resolv = path.into();
        self
    }

    /// Use a different host device directory as the `/dev` bind source.
    pub fn with_host_dev(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_dev = path.into();
        self
    }

    /// Run every stage in order against `handle`.
    pub fn run(&self, handle: &RootfsHandle) -> Result<BootstrapReport> {
        let root = handle.root();

        let arch = resolve_arch(handle.arch()).stage(Stage::ResolveArch)?;
        tracing::info!(%arch, root = %root.display(), "bootstrapping rootfs");

        let client = ReleaseClient::new(self.settings.release_base_url(&arch))
            .stage(Stage::Discover)?;
        println!("  Fetching release index from {}", client.index_url());
        let release = client.discover().stage(Stage::Discover)?;

        let tarball = handle.work_dir().join("minirootfs.tar.gz");
        println!("  Downloading {}", client.artifact_url(&release));
        client
            .download(&release, &tarball)
            .stage(Stage::Download)?;

        println!("  Extracting minirootfs...");
        extract_tarball(&tarball, root).stage(Stage::Extract)?;

        println!("  Setting up chroot mounts...");
        self.mount_chroot(root).stage(Stage::Mount)?;

        self.copy_resolv(root).stage(Stage::CopyResolv)?;

        println!("  Installing base system packages...");
        self.install_base(root).stage(Stage::InstallBase)?;

        println!("  Configuring mkinitfs for live CD...");
        configure_mkinitfs(root).stage(Stage::ConfigureInitramfs)?;

        let kernel_version = find_kernel_version(root).stage(Stage::KernelVersion)?;
        println!("  Kernel: {}", kernel_version);

        println!("  Generating initramfs...");
        generate_initramfs(self.runner, root, &kernel_version)
            .stage(Stage::GenerateInitramfs)?;

        println!("  Patching initramfs with live boot init...");
        let (initramfs, patch) = self.patch_initramfs(handle).stage(Stage::PatchInitramfs)?;

        Ok(BootstrapReport {
            release,
            kernel_version,
            initramfs,
            patch,
        })
    }

    /// Apply the build file's packages, users and services.
    ///
    /// Fails with [`BuildError::Mount`] before running anything unless the
    /// chroot mounts from [`Bootstrapper::run`] are still live.
    pub fn provision(&self, handle: &RootfsHandle, config: &BuildConfig) -> Result<()> {
        let root = handle.root();
        self.require_chroot_mounts(root)?;
        provision::install_packages(self.runner, root, &config.packages)?;
        provision::setup_users(self.runner, root, &config.users)?;
        provision::enable_services(self.runner, root, config.enabled_services())?;
        Ok(())
    }

    fn mount_chroot(&self, root: &Path) -> Result<()> {
        self.mounts
            .mount_virtual(VirtualFs::Proc, &root.join("proc"))?;
        self.mounts
            .mount_virtual(VirtualFs::Sysfs, &root.join("sys"))?;
        self.mounts.bind_mount(&self.host_dev, &root.join("dev"))?;
        Ok(())
    }

    fn require_chroot_mounts(&self, root: &Path) -> Result<()> {
        let live = self.mounts.mounts_under(root)?;
        for dir in CHROOT_MOUNTS {
            let target = root.join(dir);
            if !live.iter().any(|m| m.mount_point == target) {
                return Err(BuildError::Mount {
                    target,
                    reason: "not mounted; chroot is not set up".to_string(),
                });
            }
        }
        Ok(())
    }

    fn copy_resolv(&self, root: &Path) -> Result<()> {
        let dest = root.join("etc/resolv.conf");
        fs::create_dir_all(root.join("etc"))?;
        // Never write through a link that could point back at the host.
        if dest
            .symlink_metadata()
            .is_ok_and(|m| m.file_type().is_symlink())
        {
            fs::remove_file(&dest)?;
        }
        fs::copy(&self.host_resolv, &dest)?;
        Ok(())
    }

    fn install_base(&self, root: &Path) -> Result<()> {
        let apk_dir = root.join("etc/apk");
        fs::create_dir_all(&apk_dir)?;
        fs::write(apk_dir.join("repositories"), self.settings.repositories())?;

        let apk = Apk::new(self.runner, root);
        apk.update()?;
        apk.add(BASE_PACKAGES)
    }

    fn patch_initramfs(&self, handle: &RootfsHandle) -> Result<(PathBuf, PatchReport)> {
        let initramfs = locate_initramfs(&handle.boot_dir())?;
        let transcoder = InitramfsTranscoder::new(handle.work_dir().join("initramfs-work"));
        let report = transcoder.patch(&initramfs)?;
        Ok((initramfs, report))
    }
}
