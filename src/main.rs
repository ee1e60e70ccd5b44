//! alpiso - Alpine live ISO builder.
//!
//! Builds a bootable live ISO from a YAML build file:
//! - Alpine minirootfs bootstrapped in a chroot (packages, users, services)
//! - stock initramfs patched with a live boot init
//! - squashfs root plus isolinux on a hybrid ISO

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use alpiso::commands::{self, BuildArgs, ShowTarget};

#[derive(Parser)]
#[command(name = "alpiso")]
#[command(about = "Alpine live ISO builder", version)]
#[command(
    after_help = "QUICK START:\n  alpiso preflight          Check host tools and privileges\n  alpiso build image.yaml   Build image.iso\n  alpiso clean <work-dir>   Remove a tree left by an interrupted build"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a live ISO from a build file (requires root)
    Build {
        /// Path to the YAML build file
        config: PathBuf,

        /// Output ISO path (default: <name>.iso)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target architecture (default: host)
        #[arg(long)]
        arch: Option<String>,

        /// Keep the work tree after the build
        #[arg(long)]
        keep_work: bool,
    },

    /// Unmount and remove a work tree left behind by an interrupted build
    Clean {
        /// Work directory (alpiso-*) or its rootfs/
        root: PathBuf,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowCommand,
    },

    /// Run preflight checks (verify host tools before build)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum ShowCommand {
    /// Validate and print a build file
    Config {
        /// Path to the YAML build file
        file: PathBuf,
    },
    /// Print the generated live boot init script
    Init,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            config,
            output,
            arch,
            keep_work,
        } => commands::cmd_build(&BuildArgs {
            config,
            output,
            arch,
            keep_work,
        }),
        Commands::Clean { root } => commands::cmd_clean(&root),
        Commands::Show { what } => commands::cmd_show(match what {
            ShowCommand::Config { file } => ShowTarget::Config { file },
            ShowCommand::Init => ShowTarget::Init,
        }),
        Commands::Preflight { strict } => commands::cmd_preflight(strict),
    }
}
