//! Initramfs transcoder.
//!
//! Rewrites the initramfs generated by `mkinitfs` so it boots from live
//! media: the archive is decoded, unpacked into a scratch tree, its `/init`
//! is replaced by the [`InitScript`], and the tree is packed back into a
//! gzip-compressed newc archive.
//!
//! ```text
//! boot/initramfs-lts ──detect──→ Gzip | Raw ──decompress──→ initramfs.cpio
//!     ──extract──→ extracted/ (+ manifest of original modes/owners)
//!     ──replace init──→ repack (sorted walk) ──gzip──→ initramfs-lts.tmp
//!     ──rename──→ boot/initramfs-lts
//! ```
//!
//! The manifest exists because the scratch tree cannot hold everything the
//! archive does: symlinks always read back as 0777, device nodes need root
//! to create, ownership needs root to restore, and member names like `.` or
//! `./bin` do not survive a directory walk. Repacking takes names, modes and
//! owners from the manifest and only falls back to the filesystem for paths
//! the archive never contained.

pub mod cpio;
pub mod init;

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

use crate::error::{BuildError, Result};

use cpio::{Entry, EntryKind, S_IFDIR, S_IFLNK, S_IFREG};
pub use init::InitScript;

/// Name `mkinitfs` gives the initramfs of the LTS kernel.
pub const INITRAMFS_NAME: &str = "initramfs-lts";
/// Archive member the kernel executes first.
pub const ENTRYPOINT: &str = "init";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How the initramfs on disk is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveEncoding {
    Gzip,
    /// An uncompressed cpio stream.
    Raw,
}

impl ArchiveEncoding {
    /// Classify by signature. Anything not gzip is treated as raw cpio and
    /// rejected later by the cpio reader if it is not one.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            ArchiveEncoding::Gzip
        } else {
            ArchiveEncoding::Raw
        }
    }
}

/// Metadata recorded for each extracted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Member name as it appeared in the archive.
    pub name: OsString,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

impl EntryMeta {
    fn of(entry: &Entry) -> Self {
        Self {
            name: entry.path.clone(),
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            rdev_major: entry.rdev_major,
            rdev_minor: entry.rdev_minor,
        }
    }

    fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_mode(self.mode)
    }
}

/// Original metadata of every extracted path, keyed by normalized relative
/// path. The archive root, when listed, has the empty path.
pub type Manifest = BTreeMap<PathBuf, EntryMeta>;

/// Summary of one patch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub encoding: ArchiveEncoding,
    /// Members written to the new archive (trailer excluded).
    pub entries: usize,
    /// Whether the archive had an entrypoint before patching.
    pub replaced_entrypoint: bool,
}

/// Find the initramfs in a boot directory.
///
/// Prefers `initramfs-lts`; otherwise the first `initramfs-*` by name.
pub fn locate_initramfs(boot_dir: &Path) -> Result<PathBuf> {
    let exact = boot_dir.join(INITRAMFS_NAME);
    if exact.is_file() {
        return Ok(exact);
    }

    let pattern = format!(
        "{}/initramfs-*",
        glob::Pattern::escape(&boot_dir.to_string_lossy())
    );
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| BuildError::Transcode(format!("bad glob {}: {}", pattern, e)))?
        .filter_map(|p| p.ok())
        .filter(|p| p.is_file() && p.extension().map_or(true, |ext| ext != "tmp"))
        .collect();
    matches.sort();

    matches.into_iter().next().ok_or_else(|| {
        BuildError::Transcode(format!("no initramfs found in {}", boot_dir.display()))
    })
}

/// Patches initramfs archives using a private scratch directory.
pub struct InitramfsTranscoder {
    scratch: PathBuf,
    script: &'static InitScript,
}

impl InitramfsTranscoder {
    /// `scratch` is emptied and reused on every [`patch`](Self::patch).
    pub fn new(scratch: impl Into<PathBuf>) -> Self {
        Self {
            scratch: scratch.into(),
            script: InitScript::get(),
        }
    }

    /// Replace the entrypoint of the initramfs at `path` with the live init.
    ///
    /// The new archive is written next to the original and renamed over it,
    /// so a failure leaves the original untouched.
    pub fn patch(&self, path: &Path) -> Result<PatchReport> {
        let original =
            fs::read(path).map_err(|e| transcode_io(e, "reading", path))?;
        let encoding = ArchiveEncoding::detect(&original);
        tracing::debug!(path = %path.display(), ?encoding, bytes = original.len(), "decoding initramfs");

        self.reset_scratch()?;
        let cpio_path = self.scratch.join("initramfs.cpio");
        decompress_to(&original, encoding, &cpio_path)?;
        drop(original);

        let stream = fs::read(&cpio_path).map_err(|e| transcode_io(e, "reading", &cpio_path))?;
        let entries = cpio::read_archive(&stream)?;
        drop(stream);

        let tree = self.scratch.join("extracted");
        let mut manifest = extract(&entries, &tree)?;
        drop(entries);

        let replaced_entrypoint = self.install_entrypoint(&tree, &mut manifest)?;

        let tmp = tmp_path(path);
        let written = match repack(&tree, &manifest, &tmp) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };

        commit(&tmp, path)?;

        if let Err(e) = fs::remove_dir_all(&self.scratch) {
            tracing::warn!(path = %self.scratch.display(), error = %e, "failed to remove initramfs scratch");
        }

        tracing::info!(path = %path.display(), entries = written, "initramfs patched");
        Ok(PatchReport {
            encoding,
            entries: written,
            replaced_entrypoint,
        })
    }

    fn reset_scratch(&self) -> Result<()> {
        if self.scratch.exists() {
            fs::remove_dir_all(&self.scratch)
                .map_err(|e| transcode_io(e, "clearing", &self.scratch))?;
        }
        fs::create_dir_all(&self.scratch).map_err(|e| transcode_io(e, "creating", &self.scratch))
    }

    /// Write the live init over the entrypoint. Returns whether one existed.
    fn install_entrypoint(&self, tree: &Path, manifest: &mut Manifest) -> Result<bool> {
        let path = tree.join(ENTRYPOINT);
        let existed = path.symlink_metadata().is_ok();
        let name = manifest
            .get(Path::new(ENTRYPOINT))
            .map(|m| m.name.clone())
            .unwrap_or_else(|| OsString::from(ENTRYPOINT));
        if existed {
            remove_any(&path)?;
        } else {
            tracing::warn!("initramfs has no /{}; adding one", ENTRYPOINT);
        }

        fs::write(&path, self.script.as_bytes()).map_err(|e| transcode_io(e, "writing", &path))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .map_err(|e| transcode_io(e, "chmod", &path))?;

        manifest.insert(
            PathBuf::from(ENTRYPOINT),
            EntryMeta {
                name,
                mode: S_IFREG | 0o755,
                uid: 0,
                gid: 0,
                rdev_major: 0,
                rdev_minor: 0,
            },
        );
        Ok(existed)
    }
}

fn transcode_io(err: io::Error, action: &str, path: &Path) -> BuildError {
    BuildError::Transcode(format!("{} {}: {}", action, path.display(), err))
}

/// Move the finished archive over `path`, keeping its permissions. The
/// temporary file is removed if this fails.
fn commit(tmp: &Path, path: &Path) -> Result<()> {
    let result = (|| {
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(tmp, meta.permissions())
                .map_err(|e| transcode_io(e, "setting permissions on", tmp))?;
        }
        fs::rename(tmp, path).map_err(|e| transcode_io(e, "replacing", path))
    })();
    if result.is_err() {
        let _ = fs::remove_file(tmp);
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn decompress_to(bytes: &[u8], encoding: ArchiveEncoding, dest: &Path) -> Result<()> {
    match encoding {
        ArchiveEncoding::Gzip => {
            let mut out = File::create(dest).map_err(|e| transcode_io(e, "creating", dest))?;
            io::copy(&mut MultiGzDecoder::new(bytes), &mut out)
                .map_err(|e| BuildError::Transcode(format!("decompressing gzip stream: {}", e)))?;
            Ok(())
        }
        ArchiveEncoding::Raw => fs::write(dest, bytes).map_err(|e| transcode_io(e, "writing", dest)),
    }
}

/// Archive names are relative; strip `./` and `/` prefixes. The archive
/// root itself normalizes to the empty path.
fn normalize(name: &OsStr) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BuildError::Transcode(format!(
                    "archive member {:?} escapes the archive root",
                    name
                )))
            }
        }
    }
    Ok(rel)
}

/// Members must never be written through a symlink: an absolute link
/// target would point at the host.
fn refuse_symlinked_parent(dest: &Path, rel: &Path) -> Result<()> {
    let mut current = dest.to_path_buf();
    let parts: Vec<_> = rel.components().collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        current.push(part);
        if current
            .symlink_metadata()
            .is_ok_and(|m| m.file_type().is_symlink())
        {
            return Err(BuildError::Transcode(format!(
                "archive member {:?} lies under symlink {:?}",
                rel,
                part.as_os_str()
            )));
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = path
        .symlink_metadata()
        .map_err(|e| transcode_io(e, "stat", path))?;
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| transcode_io(e, "removing", path))
}

/// Unpack archive members under `dest` and return their original metadata.
///
/// Later members with the same path replace earlier ones. Hardlinked files
/// (newc stores the data once) are written as independent copies. Special
/// nodes become empty placeholder files; the manifest keeps their real type.
pub fn extract(entries: &[Entry], dest: &Path) -> Result<Manifest> {
    fs::create_dir_all(dest).map_err(|e| transcode_io(e, "creating", dest))?;

    let mut link_data: HashMap<(u32, u32, u32), &[u8]> = HashMap::new();
    for entry in entries {
        if entry.kind() == Some(EntryKind::File) && entry.nlink > 1 && !entry.data.is_empty() {
            link_data.insert((entry.ino, entry.dev_major, entry.dev_minor), &entry.data);
        }
    }

    let mut manifest = Manifest::new();
    for entry in entries {
        let rel = normalize(&entry.path)?;
        if rel.as_os_str().is_empty() {
            manifest.insert(rel, EntryMeta::of(entry));
            continue;
        }
        let kind = entry.kind().ok_or_else(|| {
            BuildError::Transcode(format!(
                "archive member {:?} has unknown type (mode {:o})",
                entry.path, entry.mode
            ))
        })?;

        let path = dest.join(&rel);
        refuse_symlinked_parent(dest, &rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| transcode_io(e, "creating", parent))?;
        }
        let existing = path.symlink_metadata().ok();
        if let Some(meta) = &existing {
            // A directory may be listed again; anything else is replaced.
            if !(kind == EntryKind::Dir && meta.is_dir()) {
                remove_any(&path)?;
            }
        }

        match kind {
            EntryKind::Dir => {
                fs::create_dir_all(&path).map_err(|e| transcode_io(e, "creating", &path))?;
                fs::set_permissions(&path, fs::Permissions::from_mode(entry.perm() | 0o700))
                    .map_err(|e| transcode_io(e, "chmod", &path))?;
            }
            EntryKind::File => {
                let data: &[u8] = if entry.data.is_empty() && entry.nlink > 1 {
                    link_data
                        .get(&(entry.ino, entry.dev_major, entry.dev_minor))
                        .copied()
                        .unwrap_or(&[])
                } else {
                    &entry.data
                };
                fs::write(&path, data).map_err(|e| transcode_io(e, "writing", &path))?;
                fs::set_permissions(&path, fs::Permissions::from_mode(entry.perm() | 0o600))
                    .map_err(|e| transcode_io(e, "chmod", &path))?;
            }
            EntryKind::Symlink => {
                let target = std::ffi::OsStr::from_bytes(&entry.data);
                std::os::unix::fs::symlink(target, &path)
                    .map_err(|e| transcode_io(e, "linking", &path))?;
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo | EntryKind::Socket => {
                fs::write(&path, b"").map_err(|e| transcode_io(e, "writing", &path))?;
            }
        }

        manifest.insert(rel, EntryMeta::of(entry));
    }

    Ok(manifest)
}

/// Pack the tree at `dir` into a gzip-compressed newc archive at `output`.
///
/// Siblings are visited in byte order of their names, parents before
/// children; inode numbers are assigned in visit order, and every member
/// gets mtime 0, so identical trees produce identical archives. Members
/// recorded in `manifest` are written under their original names; the tree
/// root is written only when the manifest lists it.
pub fn repack(dir: &Path, manifest: &Manifest, output: &Path) -> Result<usize> {
    let file = File::create(output).map_err(|e| transcode_io(e, "creating", output))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut writer = cpio::Writer::new(encoder);
    let mut count = 0usize;

    for item in WalkDir::new(dir).sort_by_file_name() {
        let item = item
            .map_err(|e| BuildError::Transcode(format!("walking {}: {}", dir.display(), e)))?;
        let path = item.path();
        let rel = path
            .strip_prefix(dir)
            .map_err(|e| BuildError::Transcode(e.to_string()))?;
        if item.depth() == 0 && !manifest.contains_key(rel) {
            continue;
        }
        let meta = item
            .metadata()
            .map_err(|e| BuildError::Transcode(format!("stat {}: {}", path.display(), e)))?;
        let recorded = manifest.get(rel);
        let recorded_kind = recorded.and_then(EntryMeta::kind);

        let ft = meta.file_type();
        let mut entry = if ft.is_symlink() {
            let target = fs::read_link(path).map_err(|e| transcode_io(e, "reading link", path))?;
            Entry {
                mode: match recorded {
                    Some(m) if recorded_kind == Some(EntryKind::Symlink) => m.mode,
                    _ => S_IFLNK | 0o777,
                },
                nlink: 1,
                data: target.as_os_str().as_bytes().to_vec(),
                ..Default::default()
            }
        } else if ft.is_dir() {
            Entry {
                mode: match recorded {
                    Some(m) if recorded_kind == Some(EntryKind::Dir) => m.mode,
                    _ => S_IFDIR | (meta.mode() & 0o7777),
                },
                nlink: 2,
                ..Default::default()
            }
        } else if ft.is_file() {
            match recorded {
                Some(m) if recorded_kind.is_some_and(|k| k.is_special()) => Entry {
                    mode: m.mode,
                    nlink: 1,
                    rdev_major: m.rdev_major,
                    rdev_minor: m.rdev_minor,
                    ..Default::default()
                },
                _ => Entry {
                    mode: match recorded {
                        Some(m) if recorded_kind == Some(EntryKind::File) => m.mode,
                        _ => S_IFREG | (meta.mode() & 0o7777),
                    },
                    nlink: 1,
                    data: fs::read(path).map_err(|e| transcode_io(e, "reading", path))?,
                    ..Default::default()
                },
            }
        } else {
            tracing::warn!(path = %path.display(), "skipping unsupported file type");
            continue;
        };

        count += 1;
        entry.path = match recorded {
            Some(m) => m.name.clone(),
            None => rel.as_os_str().to_os_string(),
        };
        entry.ino = count as u32;
        if let Some(m) = recorded {
            entry.uid = m.uid;
            entry.gid = m.gid;
        }
        writer
            .append(&entry)
            .map_err(|e| transcode_io(e, "writing", output))?;
    }

    let encoder = writer
        .finish()
        .map_err(|e| transcode_io(e, "writing", output))?;
    let mut buffered = encoder
        .finish()
        .map_err(|e| transcode_io(e, "compressing", output))?;
    buffered
        .flush()
        .map_err(|e| transcode_io(e, "flushing", output))?;
    let file = buffered
        .into_inner()
        .map_err(|e| transcode_io(e.into_error(), "flushing", output))?;
    file.sync_all()
        .map_err(|e| transcode_io(e, "syncing", output))?;

    Ok(count)
}
