//! Centralized command execution with consistent error handling.
//!
//! Every external tool the builder runs (mount, chroot, apk, mksquashfs,
//! xorriso) goes through [`Cmd`], which captures stderr so failures carry a
//! useful message. Commands that must run inside the new root go through the
//! [`RootRunner`] capability so the bootstrapper can be exercised without
//! root privileges.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;

/// Failure to run an external command.
#[derive(Debug, Error)]
pub enum CmdError {
    #[error("failed to execute '{program}' (is it installed?): {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{prefix} (exit code {code}){}", format_stderr(stderr))]
    Failed {
        prefix: String,
        code: i32,
        stderr: String,
    },
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{}", stderr)
    }
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            stdin: None,
            error_prefix: None,
        }
    }

    /// `chroot <root> <program>`; further args go to `program`.
    pub fn chroot(root: &Path, program: impl AsRef<str>) -> Self {
        Cmd::new("chroot").arg_path(root).arg(program)
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Feed `input` to the command's stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Human-readable command line, for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> CmdError {
        CmdError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    fn prefix(&self) -> String {
        self.error_prefix
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program))
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult, CmdError> {
        tracing::debug!(command = %self.display(), "running");
        let mut cmd = self.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        if let Some(input) = &self.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .map_err(|e| self.spawn_error(e))?;
            }
        }
        let output = child.wait_with_output().map_err(|e| self.spawn_error(e))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            return Err(CmdError::Failed {
                prefix: self.prefix(),
                code: result.code(),
                stderr: result.stderr_trimmed().to_string(),
            });
        }

        Ok(result)
    }

    /// Run with inherited stdio so long-running tools stream their progress.
    pub fn run_interactive(self) -> Result<ExitStatus, CmdError> {
        tracing::debug!(command = %self.display(), "running (interactive)");
        let mut cmd = self.command();
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let status = cmd.status().map_err(|e| self.spawn_error(e))?;

        if !status.success() {
            return Err(CmdError::Failed {
                prefix: self.prefix(),
                code: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }

        Ok(status)
    }
}

/// Check if a program exists in PATH, returning its full path.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

// =============================================================================
// Chroot execution capability
// =============================================================================

/// Runs programs inside a root filesystem tree.
///
/// Production code uses [`ChrootRunner`]; tests substitute a recorder.
pub trait RootRunner {
    /// Run `program args...` with `root` as its filesystem root and return stdout.
    fn run_in_root(&self, root: &Path, program: &str, args: &[&str]) -> Result<String, CmdError>;

    /// Like [`RootRunner::run_in_root`], feeding `input` on stdin.
    fn run_in_root_with_input(
        &self,
        root: &Path,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<String, CmdError>;
}

/// Executes through the host `chroot` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChrootRunner;

impl RootRunner for ChrootRunner {
    fn run_in_root(&self, root: &Path, program: &str, args: &[&str]) -> Result<String, CmdError> {
        let result = Cmd::chroot(root, program).args(args).run()?;
        Ok(result.stdout)
    }

    fn run_in_root_with_input(
        &self,
        root: &Path,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<String, CmdError> {
        let result = Cmd::chroot(root, program).args(args).stdin(input).run()?;
        Ok(result.stdout)
    }
}
