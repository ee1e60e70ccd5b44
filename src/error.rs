//! Error taxonomy for the build core.
//!
//! Every fallible operation in the library returns [`BuildError`]. The
//! bootstrapper wraps failures in [`BuildError::Stage`] so the caller can
//! report which step of the pipeline aborted the build.
//!
//! Failures are classified by [`Severity`]: unmounting is best-effort and
//! its failures are [`Severity::Recoverable`]; everything else aborts.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::CmdError;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Whether a failure must abort the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged and collected; the caller continues.
    Recoverable,
    /// Aborts the current build.
    Fatal,
}

/// Pipeline steps of the rootfs bootstrap, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ResolveArch,
    Discover,
    Download,
    Extract,
    Mount,
    CopyResolv,
    InstallBase,
    ConfigureInitramfs,
    KernelVersion,
    GenerateInitramfs,
    PatchInitramfs,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolveArch => "resolve-arch",
            Stage::Discover => "discover",
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Mount => "mount",
            Stage::CopyResolv => "copy-resolv",
            Stage::InstallBase => "install-base",
            Stage::ConfigureInitramfs => "configure-initramfs",
            Stage::KernelVersion => "kernel-version",
            Stage::GenerateInitramfs => "generate-initramfs",
            Stage::PatchInitramfs => "patch-initramfs",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("release discovery failed: {0}")]
    Discovery(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("mount of {target} failed: {reason}")]
    Mount { target: PathBuf, reason: String },

    #[error("unmount of {target} failed: {reason}")]
    Unmount { target: PathBuf, reason: String },

    #[error(
        "refusing to delete under {root}: {} mount(s) still active ({})",
        mounts.len(),
        mounts.iter().map(|m| m.display().to_string()).collect::<Vec<_>>().join(", ")
    )]
    ActiveMounts { root: PathBuf, mounts: Vec<PathBuf> },

    #[error("extract failed: {0}")]
    Extract(String),

    #[error("initramfs transcode failed: {0}")]
    Transcode(String),

    #[error("`{command}` failed inside the chroot: {reason}")]
    Provisioning { command: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage} stage failed")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<BuildError>,
    },
}

impl BuildError {
    pub fn mount(target: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        BuildError::Mount {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn provisioning(command: impl Into<String>, err: CmdError) -> Self {
        BuildError::Provisioning {
            command: command.into(),
            reason: err.to_string(),
        }
    }

    /// Tag this error with the pipeline stage it came from.
    ///
    /// An error that already carries a stage keeps its original tag.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            tagged @ BuildError::Stage { .. } => tagged,
            other => BuildError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            BuildError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The untagged error underneath any stage wrapper.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.root_cause() {
            BuildError::Unmount { .. } => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }
}

/// Extension for tagging results with their pipeline stage.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| e.at(stage))
    }
}
