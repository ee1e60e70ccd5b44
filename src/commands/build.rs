//! Build command - turns a build file into a bootable ISO.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::artifact::{self, SyslinuxSearch};
use crate::config::{BuildConfig, Settings};
use crate::error::BuildError;
use crate::mount::{MountManager, ProcMounts, SystemMounter};
use crate::preflight;
use crate::process::ChrootRunner;
use crate::rootfs::{Bootstrapper, RootfsHandle};
use crate::sbom;
use crate::timing::{format_duration, Timer};

const TOTAL_STEPS: usize = 7;

/// Exit status after an interrupt, as a shell reports SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

/// Options for the build command.
#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub config: PathBuf,
    pub output: Option<PathBuf>,
    pub arch: Option<String>,
    pub keep_work: bool,
}

fn step(n: usize, msg: &str) {
    println!("\n[{}/{}] {}", n, TOTAL_STEPS, msg);
}

/// Execute the build command.
pub fn cmd_build(args: &BuildArgs) -> Result<()> {
    let build_start = Instant::now();
    let settings = Settings::load();

    step(1, "Loading build configuration...");
    let config = BuildConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.print();
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| config.default_output());
    let arch = args
        .arch
        .clone()
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());
    let keep_work = args.keep_work || settings.keep_work;

    step(2, "Checking host dependencies...");
    let syslinux = SyslinuxSearch::default();
    preflight::run_preflight_or_fail(&syslinux)?;

    let handle = RootfsHandle::create(&settings.work_root, &config.name, &arch)
        .context("creating work tree")?;
    println!("Work tree: {}", handle.work_dir().display());

    install_interrupt_handler(handle.root().to_path_buf())?;

    let mounts = MountManager::system();
    let result = run_pipeline(&settings, &config, &handle, &mounts, &syslinux, &output);

    match result {
        Ok(()) => {
            if keep_work {
                println!("Work tree kept at {}", handle.work_dir().display());
            } else {
                handle
                    .destroy(&mounts)
                    .context("removing work tree after build")?;
            }
            println!(
                "\n✓ Build complete! ({})\n  ISO: {}",
                format_duration(build_start.elapsed()),
                output.display()
            );
            Ok(())
        }
        Err(e) => {
            if let Some(stage) = e.downcast_ref::<BuildError>().and_then(BuildError::stage) {
                eprintln!("\n✗ Build failed during the {} stage", stage);
            }
            let report = mounts.unmount_all(handle.root());
            for failure in &report.failures {
                eprintln!("  [WARN] {}", failure);
            }
            if keep_work {
                eprintln!("Work tree kept at {}", handle.work_dir().display());
            } else {
                let work_dir = handle.work_dir().to_path_buf();
                if let Err(cleanup) = handle.destroy(&mounts) {
                    eprintln!(
                        "  [WARN] Work tree {} left in place: {}",
                        work_dir.display(),
                        cleanup
                    );
                }
            }
            Err(e)
        }
    }
}

fn run_pipeline(
    settings: &Settings,
    config: &BuildConfig,
    handle: &RootfsHandle,
    mounts: &MountManager<ProcMounts, SystemMounter>,
    syslinux: &SyslinuxSearch,
    output: &Path,
) -> Result<()> {
    let runner = ChrootRunner;
    let bootstrapper = Bootstrapper::new(settings, mounts, &runner);

    step(3, "Bootstrapping Alpine rootfs...");
    let t = Timer::start("Bootstrap");
    let report = bootstrapper.run(handle)?;
    println!(
        "  Release {} / kernel {} / {} initramfs entries",
        report.release.file, report.kernel_version, report.patch.entries
    );
    t.finish();

    step(4, "Provisioning packages, users and services...");
    let t = Timer::start("Provision");
    bootstrapper.provision(handle, config)?;
    t.finish();

    step(5, "Generating SBOM...");
    if config.sbom_enabled() {
        let sbom_out = sbom::sbom_path(output);
        if let Some(parent) = sbom_out.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        sbom::generate(
            &runner,
            handle.root(),
            &config.name,
            &config.version,
            &sbom_out,
        )?;
    } else {
        println!("  Skipped (build.sbom is off)");
    }

    step(6, "Setting up bootloader...");
    let t = Timer::start("Bootloader");
    let staging = handle.staging_dir();
    fs::create_dir_all(&staging)
        .with_context(|| format!("creating {}", staging.display()))?;
    let unmounted = handle.clean_for_packaging(mounts)?;
    tracing::info!(count = unmounted.unmounted.len(), "chroot mounts released");
    artifact::stage_bootloader(handle.root(), &staging, syslinux)?;
    t.finish();

    step(7, "Creating ISO...");
    let t = Timer::start("ISO");
    artifact::create_iso(handle.root(), &staging, output, syslinux)?;
    t.finish();

    Ok(())
}

/// On Ctrl-C, unmount everything below `root` and exit.
fn install_interrupt_handler(root: PathBuf) -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, unmounting {}...", root.display());
        let report = MountManager::system().unmount_all(&root);
        for failure in &report.failures {
            eprintln!("  [WARN] {}", failure);
        }
        std::process::exit(INTERRUPTED_EXIT);
    })
    .context("installing interrupt handler")
}
