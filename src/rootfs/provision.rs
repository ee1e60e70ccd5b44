//! Provisioning inside the chroot: packages, users, services.
//!
//! All commands go through a [`RootRunner`], so nothing here needs root
//! privileges under test. A non-zero exit becomes
//! [`BuildError::Provisioning`] naming the command that failed.

use std::path::Path;

use crate::config::User;
use crate::error::{BuildError, Result};
use crate::process::RootRunner;
use crate::sbom::{parse_package_line, InstalledPackage};

/// Thin wrapper over `apk` running inside one root.
pub struct Apk<'a> {
    runner: &'a dyn RootRunner,
    root: &'a Path,
}

impl<'a> Apk<'a> {
    pub fn new(runner: &'a dyn RootRunner, root: &'a Path) -> Self {
        Self { runner, root }
    }

    /// Refresh the package index.
    pub fn update(&self) -> Result<()> {
        self.run(&["update"])?;
        Ok(())
    }

    /// Install packages without keeping a local cache.
    pub fn add(&self, packages: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--no-cache"];
        args.extend_from_slice(packages);
        self.run(&args)?;
        Ok(())
    }

    /// Installed packages with versions (`apk info -v`).
    pub fn installed(&self) -> Result<Vec<InstalledPackage>> {
        let output = self.run(&["info", "-v"])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(parse_package_line)
            .collect())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        self.runner
            .run_in_root(self.root, "apk", args)
            .map_err(|e| BuildError::provisioning(format!("apk {}", args.join(" ")), e))
    }
}

/// Install the user's extra packages. An empty list does nothing.
pub fn install_packages(runner: &dyn RootRunner, root: &Path, packages: &[String]) -> Result<()> {
    if packages.is_empty() {
        println!("  No additional packages to install");
        return Ok(());
    }
    println!("  Installing packages: {}", packages.join(", "));
    let names: Vec<&str> = packages.iter().map(String::as_str).collect();
    Apk::new(runner, root).add(&names)
}

/// Create users and set their passwords.
///
/// `root` already exists in the base system and is never re-created. The
/// password goes to `chpasswd` on stdin, never through a shell command line.
pub fn setup_users(runner: &dyn RootRunner, root: &Path, users: &[User]) -> Result<()> {
    for user in users {
        println!("  Setting up user: {}", user.name);

        if user.name != "root" {
            runner
                .run_in_root(root, "adduser", &["-D", &user.name])
                .map_err(|e| BuildError::provisioning(format!("adduser -D {}", user.name), e))?;
        }

        let input = format!("{}:{}\n", user.name, user.password);
        runner
            .run_in_root_with_input(root, "chpasswd", &[], &input)
            .map_err(|e| {
                BuildError::provisioning(format!("chpasswd (user {})", user.name), e)
            })?;
    }
    Ok(())
}

/// Add OpenRC services to the default runlevel.
pub fn enable_services(runner: &dyn RootRunner, root: &Path, services: &[String]) -> Result<()> {
    if services.is_empty() {
        println!("  No services to enable");
        return Ok(());
    }
    for svc in services {
        println!("  Enabling service: {}", svc);
        runner
            .run_in_root(root, "rc-update", &["add", svc, "default"])
            .map_err(|e| BuildError::provisioning(format!("rc-update add {} default", svc), e))?;
    }
    Ok(())
}

/// Every installed package, as reported by the package manager.
pub fn installed_packages(runner: &dyn RootRunner, root: &Path) -> Result<Vec<InstalledPackage>> {
    Apk::new(runner, root).installed()
}
