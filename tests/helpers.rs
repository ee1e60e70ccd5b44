//! Shared test utilities for alpiso tests.
//!
//! Nothing here needs root: mounts are simulated against an in-memory mount
//! table and chroot commands are recorded instead of executed.
#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use alpiso::initramfs::cpio::{self, Entry};
use alpiso::mount::{MountKind, MountManager, MountRecord, MountTable, Mounter, VirtualFs};
use alpiso::process::{CmdError, RootRunner};
use flate2::write::GzEncoder;
use flate2::Compression;

/// Ordered log of every simulated mount and chroot command.
pub type EventLog = Rc<RefCell<Vec<String>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

// =============================================================================
// Simulated mounts
// =============================================================================

/// In-memory mount table plus a mounter that edits it.
///
/// Bind mounts are simulated by replacing the target with a symlink to the
/// source, so deleting through an active bind reaches the "host" directory.
pub struct SimulatedMounts {
    table: RefCell<Vec<MountRecord>>,
    stuck: RefCell<Vec<PathBuf>>,
    events: EventLog,
}

impl SimulatedMounts {
    pub fn new(events: EventLog) -> Self {
        Self {
            table: RefCell::new(Vec::new()),
            stuck: RefCell::new(Vec::new()),
            events,
        }
    }

    /// Record a mount without going through the mounter.
    pub fn add(&self, mount_point: impl Into<PathBuf>, kind: MountKind) {
        self.table
            .borrow_mut()
            .push(MountRecord::new(mount_point, kind));
    }

    /// Make every unmount of `mount_point` fail with "target is busy".
    pub fn stick(&self, mount_point: impl Into<PathBuf>) {
        self.stuck.borrow_mut().push(mount_point.into());
    }

    pub fn live(&self) -> Vec<PathBuf> {
        self.table
            .borrow()
            .iter()
            .map(|m| m.mount_point.clone())
            .collect()
    }

    pub fn manager(&self) -> MountManager<&Self, &Self> {
        MountManager::new(self, self)
    }

    fn log(&self, event: String) {
        self.events.borrow_mut().push(event);
    }
}

impl MountTable for SimulatedMounts {
    fn mounts(&self) -> std::io::Result<Vec<MountRecord>> {
        Ok(self.table.borrow().clone())
    }
}

impl Mounter for SimulatedMounts {
    fn mount_virtual(&self, fs: VirtualFs, target: &Path) -> Result<(), CmdError> {
        self.log(format!("mount {} {}", fs.fstype(), target.display()));
        self.add(target, MountKind::Virtual);
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<(), CmdError> {
        self.log(format!("bind {} {}", source.display(), target.display()));
        if target.is_dir() {
            let _ = fs::remove_dir(target);
        }
        std::os::unix::fs::symlink(source, target).map_err(|e| CmdError::Spawn {
            program: "mount".into(),
            source: e,
        })?;
        self.add(target, MountKind::Bind);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), CmdError> {
        if self.stuck.borrow().iter().any(|p| p == target) {
            self.log(format!("umount-busy {}", target.display()));
            return Err(CmdError::Failed {
                prefix: format!("umount {}", target.display()),
                code: 32,
                stderr: "target is busy".into(),
            });
        }
        self.log(format!("umount {}", target.display()));
        self.table.borrow_mut().retain(|m| m.mount_point != target);
        // An unmounted bind leaves the empty mount point behind.
        if target
            .symlink_metadata()
            .is_ok_and(|m| m.file_type().is_symlink())
        {
            let _ = fs::remove_file(target);
            let _ = fs::create_dir(target);
        }
        Ok(())
    }
}

// =============================================================================
// Recording chroot runner
// =============================================================================

/// Records chroot commands and fakes the few with side effects.
///
/// `mkinitfs` writes a gzip initramfs to `boot/initramfs-lts`; `apk info -v`
/// answers with `installed`.
pub struct RecordingRunner {
    events: EventLog,
    installed: String,
    fail_on: Option<String>,
}

impl RecordingRunner {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            installed: "alpine-base-3.19.1-r0\nbusybox-1.36.1-r15\nlinux-lts-6.6.14-r0\n".into(),
            fail_on: None,
        }
    }

    /// Fail any command whose line starts with `prefix`.
    pub fn failing_on(mut self, prefix: &str) -> Self {
        self.fail_on = Some(prefix.to_string());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

impl RootRunner for RecordingRunner {
    fn run_in_root(&self, root: &Path, program: &str, args: &[&str]) -> Result<String, CmdError> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.events.borrow_mut().push(line.clone());

        if self.fail_on.as_deref().is_some_and(|p| line.starts_with(p)) {
            return Err(CmdError::Failed {
                prefix: line,
                code: 1,
                stderr: "simulated failure".into(),
            });
        }

        match program {
            "mkinitfs" => {
                let boot = root.join("boot");
                fs::create_dir_all(&boot).map_err(|e| CmdError::Spawn {
                    program: program.into(),
                    source: e,
                })?;
                fs::write(boot.join("initramfs-lts"), gzip(&cpio_bytes(&stock_initramfs())))
                    .map_err(|e| CmdError::Spawn {
                        program: program.into(),
                        source: e,
                    })?;
                Ok(String::new())
            }
            "apk" if args == ["info", "-v"] => Ok(self.installed.clone()),
            _ => Ok(String::new()),
        }
    }

    fn run_in_root_with_input(
        &self,
        root: &Path,
        program: &str,
        args: &[&str],
        _input: &str,
    ) -> Result<String, CmdError> {
        self.run_in_root(root, program, args)
    }
}

// =============================================================================
// Archive builders
// =============================================================================

/// A small mkinitfs-style archive: busybox, a symlinked shell, a console
/// device node and the stock `/init`.
pub fn stock_initramfs() -> Vec<Entry> {
    vec![
        Entry::dir(".", 0o755),
        Entry::dir("bin", 0o755),
        Entry::file("bin/busybox", 0o755, b"\x7fELF busybox".to_vec()),
        Entry::symlink("bin/sh", 0o777, "busybox"),
        Entry::dir("dev", 0o755),
        Entry {
            path: "dev/console".into(),
            mode: cpio::S_IFCHR | 0o600,
            nlink: 1,
            rdev_major: 5,
            rdev_minor: 1,
            ..Default::default()
        },
        Entry::file("init", 0o755, "#!/bin/sh\nexec /sbin/nlplug-findfs\n"),
    ]
}

pub fn cpio_bytes(entries: &[Entry]) -> Vec<u8> {
    let mut writer = cpio::Writer::new(Vec::new());
    for entry in entries {
        writer.append(entry).expect("writing cpio entry");
    }
    writer.finish().expect("finishing cpio archive")
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes).expect("compressing");
    enc.finish().expect("finishing gzip stream")
}

pub fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut raw = Vec::new();
    std::io::Read::read_to_end(&mut flate2::read::MultiGzDecoder::new(bytes), &mut raw)
        .expect("decompressing");
    raw
}

/// Members of the gzip newc archive at `path`.
pub fn read_initramfs(path: &Path) -> Vec<Entry> {
    let bytes = fs::read(path).expect("reading initramfs");
    cpio::read_archive(&gunzip(&bytes)).expect("parsing initramfs")
}

/// A minirootfs tarball with a kernel module tree and `/etc`.
pub fn minirootfs_tarball() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    for dir in ["etc/", "lib/", "lib/modules/", "lib/modules/6.6.14-0-lts/"] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_data(&mut header, dir, std::io::empty())
            .expect("appending directory");
    }

    let release = b"3.19.1\n";
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(release.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, "etc/alpine-release", &release[..])
        .expect("appending file");

    builder
        .into_inner()
        .expect("finishing tar")
        .finish()
        .expect("finishing gzip")
}
