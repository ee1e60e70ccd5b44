//! Initramfs transcode tests against whole archives.

mod helpers;

use std::fs;
use std::os::unix::fs::PermissionsExt;

use alpiso::initramfs::cpio::{self, Entry, EntryKind};
use alpiso::initramfs::{locate_initramfs, ArchiveEncoding, InitScript, InitramfsTranscoder};
use helpers::{cpio_bytes, gzip, read_initramfs, stock_initramfs};
use tempfile::TempDir;

fn find<'a>(entries: &'a [Entry], path: &str) -> &'a Entry {
    entries
        .iter()
        .find(|e| e.path == path)
        .unwrap_or_else(|| panic!("{path} missing from archive"))
}

#[test]
fn test_symlink_mode_survives_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("initramfs-lts");
    let archive = cpio_bytes(&[
        Entry::file("a", 0o644, "alpha"),
        Entry::symlink("b", 0o755, "a"),
        Entry::file("init", 0o755, "old"),
    ]);
    fs::write(&path, gzip(&archive)).unwrap();

    InitramfsTranscoder::new(temp.path().join("scratch"))
        .patch(&path)
        .unwrap();

    let entries = read_initramfs(&path);
    let a = find(&entries, "a");
    assert_eq!(a.mode, cpio::S_IFREG | 0o644);
    assert_eq!(a.data, b"alpha");
    let b = find(&entries, "b");
    assert_eq!(b.kind(), Some(EntryKind::Symlink));
    assert_eq!(b.mode, cpio::S_IFLNK | 0o755);
    assert_eq!(b.data, b"a");
}

#[test]
fn test_raw_and_gzip_inputs_both_become_gzip() {
    for compress in [true, false] {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("initramfs-lts");
        let archive = cpio_bytes(&stock_initramfs());
        let input = if compress { gzip(&archive) } else { archive };
        fs::write(&path, &input).unwrap();

        let report = InitramfsTranscoder::new(temp.path().join("scratch"))
            .patch(&path)
            .unwrap();

        let expected = if compress {
            ArchiveEncoding::Gzip
        } else {
            ArchiveEncoding::Raw
        };
        assert_eq!(report.encoding, expected);
        assert!(report.replaced_entrypoint);
        assert_eq!(
            ArchiveEncoding::detect(&fs::read(&path).unwrap()),
            ArchiveEncoding::Gzip
        );
        assert!(!temp.path().join("scratch").exists());
    }
}

#[test]
fn test_entrypoint_is_live_init() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("initramfs-lts");
    fs::write(&path, gzip(&cpio_bytes(&stock_initramfs()))).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

    InitramfsTranscoder::new(temp.path().join("scratch"))
        .patch(&path)
        .unwrap();

    let entries = read_initramfs(&path);
    let init = find(&entries, "init");
    assert_eq!(init.mode, cpio::S_IFREG | 0o755);
    assert_eq!((init.uid, init.gid), (0, 0));
    assert_eq!(init.data, InitScript::get().as_bytes());

    // Everything else is carried over, the archive root included.
    let carried = |list: &[Entry]| {
        let mut out: Vec<_> = list
            .iter()
            .filter(|e| e.path != "init")
            .map(|e| (e.path.clone(), e.mode, e.data.clone()))
            .collect();
        out.sort();
        out
    };
    assert_eq!(carried(&entries), carried(&stock_initramfs()));
    assert_eq!(find(&entries, ".").mode, cpio::S_IFDIR | 0o755);
    assert_eq!(find(&entries, "bin/sh").data, b"busybox");
    let console = find(&entries, "dev/console");
    assert_eq!(console.kind(), Some(EntryKind::CharDevice));
    assert_eq!((console.rdev_major, console.rdev_minor), (5, 1));

    // The archive keeps the original file's permissions.
    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[test]
fn test_missing_entrypoint_is_added() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("initramfs-lts");
    fs::write(&path, gzip(&cpio_bytes(&[Entry::dir("etc", 0o755)]))).unwrap();

    let report = InitramfsTranscoder::new(temp.path().join("scratch"))
        .patch(&path)
        .unwrap();

    assert!(!report.replaced_entrypoint);
    let entries = read_initramfs(&path);
    assert_eq!(find(&entries, "init").data, InitScript::get().as_bytes());
}

#[test]
fn test_patch_located_archive() {
    let temp = TempDir::new().unwrap();
    let boot = temp.path().join("boot");
    fs::create_dir_all(&boot).unwrap();
    fs::write(boot.join("vmlinuz-lts"), b"kernel").unwrap();
    fs::write(
        boot.join("initramfs-lts"),
        gzip(&cpio_bytes(&stock_initramfs())),
    )
    .unwrap();

    let path = locate_initramfs(&boot).unwrap();
    InitramfsTranscoder::new(temp.path().join("scratch"))
        .patch(&path)
        .unwrap();

    assert!(!boot.join("initramfs-lts.tmp").exists());
    assert_eq!(
        find(&read_initramfs(&path), "init").data,
        InitScript::get().as_bytes()
    );
}
