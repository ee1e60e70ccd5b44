//! Configuration management for alpiso.
//!
//! Two sources:
//! - the **build file** (YAML) describing one image: name, packages, users,
//!   services, SBOM toggle;
//! - **settings** from `.env` and the environment: mirror, release branch,
//!   where work trees live. Environment variables take precedence over `.env`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{BuildError, Result};

pub const DEFAULT_MIRROR: &str = "https://dl-cdn.alpinelinux.org/alpine";
pub const DEFAULT_BRANCH: &str = "latest-stable";

/// The only base distribution supported.
pub const SUPPORTED_BASE: &str = "alpine";

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub distro: Distro,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub services: Option<Services>,
    #[serde(default)]
    pub build: Option<BuildOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Distro {
    #[serde(default)]
    pub base: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Services {
    #[serde(default)]
    pub enable: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildOptions {
    #[serde(default)]
    pub sbom: bool,
}

impl BuildConfig {
    /// Read, parse and validate a build file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: BuildConfig = serde_yaml::from_str(content)
            .map_err(|e| BuildError::Config(format!("parsing YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every constraint and report all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();

        if self.version.is_empty() {
            errs.push("\"version\" is required".to_string());
        }
        if self.name.is_empty() {
            errs.push("\"name\" is required".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            errs.push(format!(
                "\"name\" {:?} may only contain letters, digits, '-', '_' and '.'",
                self.name
            ));
        }

        if self.distro.base.is_empty() {
            errs.push("\"distro.base\" is required".to_string());
        } else if self.distro.base != SUPPORTED_BASE {
            errs.push(format!(
                "unsupported distro base {:?}: only {:?} is supported",
                self.distro.base, SUPPORTED_BASE
            ));
        }

        if self.users.is_empty() {
            errs.push("at least one user must be defined in \"users\"".to_string());
        }
        for (i, user) in self.users.iter().enumerate() {
            if user.name.is_empty() {
                errs.push(format!("users[{}]: \"name\" is required", i));
            }
            if user.password.is_empty() {
                errs.push(format!("users[{}]: \"password\" is required", i));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Config(format!(
                "validation failed:\n  - {}",
                errs.join("\n  - ")
            )))
        }
    }

    pub fn sbom_enabled(&self) -> bool {
        self.build.as_ref().is_some_and(|b| b.sbom)
    }

    pub fn enabled_services(&self) -> &[String] {
        self.services
            .as_ref()
            .map(|s| s.enable.as_slice())
            .unwrap_or(&[])
    }

    /// Default ISO path: `<name>.iso` in the current directory.
    pub fn default_output(&self) -> PathBuf {
        PathBuf::from(format!("{}.iso", self.name))
    }

    /// Print configuration for inspection.
    pub fn print(&self) {
        println!("Build file:");
        println!("  name: {}", self.name);
        println!("  version: {}", self.version);
        println!("  base: {}", self.distro.base);
        if self.packages.is_empty() {
            println!("  packages: (none)");
        } else {
            println!("  packages: {}", self.packages.join(", "));
        }
        let users: Vec<&str> = self.users.iter().map(|u| u.name.as_str()).collect();
        println!("  users: {}", users.join(", "));
        let services = self.enabled_services();
        if !services.is_empty() {
            println!("  services: {}", services.join(", "));
        }
        println!("  sbom: {}", self.sbom_enabled());
    }
}

/// Map a Rust target architecture name to Alpine's naming.
pub fn alpine_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" | "amd64" => "x86_64",
        "aarch64" | "arm64" => "aarch64",
        "arm" => "armv7",
        "x86" | "i686" | "i386" => "x86",
        other => other,
    }
}

/// Host environment settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Mirror root, e.g. `https://dl-cdn.alpinelinux.org/alpine`.
    pub mirror: String,
    /// Release branch, e.g. `latest-stable` or `v3.19`.
    pub branch: String,
    /// Directory under which per-run work trees are created.
    pub work_root: PathBuf,
    /// Keep the work tree after the build instead of removing it.
    pub keep_work: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mirror: DEFAULT_MIRROR.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            work_root: env::temp_dir(),
            keep_work: false,
        }
    }
}

impl Settings {
    /// Load `.env` (if present) then read `ALPISO_*` variables.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Settings::default();
        Self {
            mirror: lookup("ALPISO_MIRROR")
                .map(|m| m.trim_end_matches('/').to_string())
                .unwrap_or(defaults.mirror),
            branch: lookup("ALPISO_BRANCH").unwrap_or(defaults.branch),
            work_root: lookup("ALPISO_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_root),
            keep_work: lookup("ALPISO_KEEP_WORK")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }

    /// Directory holding `latest-releases.yaml` and the release artifacts.
    pub fn release_base_url(&self, arch: &str) -> String {
        format!("{}/{}/releases/{}", self.mirror, self.branch, arch)
    }

    /// Contents of `/etc/apk/repositories` for the new root.
    pub fn repositories(&self) -> String {
        format!(
            "{mirror}/{branch}/main\n{mirror}/{branch}/community\n",
            mirror = self.mirror,
            branch = self.branch
        )
    }

    pub fn print(&self) {
        println!("Settings:");
        println!("  ALPISO_MIRROR: {}", self.mirror);
        println!("  ALPISO_BRANCH: {}", self.branch);
        println!("  ALPISO_WORK_ROOT: {}", self.work_root.display());
        println!("  ALPISO_KEEP_WORK: {}", self.keep_work);
    }
}
