//! newc cpio codec.
//!
//! The Linux initramfs format: each member is a 110-byte ASCII header
//! (`070701` followed by thirteen 8-digit hex fields), the NUL-terminated
//! name padded to a 4-byte boundary, then the data padded to a 4-byte
//! boundary. The archive ends with a member named `TRAILER!!!`.
//!
//! ```text
//! magic ino mode uid gid nlink mtime filesize devmajor devminor
//!       rdevmajor rdevminor namesize check
//! ```

use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::error::{BuildError, Result};

pub const NEWC_MAGIC: &[u8; 6] = b"070701";
/// Same layout with a checksum in the last field; read but never written.
pub const NEWC_CRC_MAGIC: &[u8; 6] = b"070702";
pub const TRAILER: &str = "TRAILER!!!";

const HEADER_LEN: usize = 110;
const FIELD_COUNT: usize = 13;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(EntryKind::File),
            S_IFDIR => Some(EntryKind::Dir),
            S_IFLNK => Some(EntryKind::Symlink),
            S_IFCHR => Some(EntryKind::CharDevice),
            S_IFBLK => Some(EntryKind::BlockDevice),
            S_IFIFO => Some(EntryKind::Fifo),
            S_IFSOCK => Some(EntryKind::Socket),
            _ => None,
        }
    }

    /// Nodes that carry no data and are recreated from metadata alone.
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo | EntryKind::Socket
        )
    }
}

/// One archive member.
///
/// `path` is the member name exactly as stored, without the trailing NUL.
/// `data` holds file content for regular files and the link target for
/// symlinks; it is empty for everything else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub path: OsString,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub ino: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn file(path: impl Into<OsString>, perm: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            mode: S_IFREG | (perm & 0o7777),
            nlink: 1,
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn dir(path: impl Into<OsString>, perm: u32) -> Self {
        Self {
            path: path.into(),
            mode: S_IFDIR | (perm & 0o7777),
            nlink: 2,
            ..Default::default()
        }
    }

    pub fn symlink(path: impl Into<OsString>, perm: u32, target: impl Into<OsString>) -> Self {
        Self {
            path: path.into(),
            mode: S_IFLNK | (perm & 0o7777),
            nlink: 1,
            data: target.into().into_vec(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_mode(self.mode)
    }

    /// Permission bits (including setuid/setgid/sticky).
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }
}

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn align4(offset: usize) -> usize {
    offset + pad4(offset)
}

fn corrupt(offset: usize, what: impl std::fmt::Display) -> BuildError {
    BuildError::Transcode(format!("corrupt cpio archive at byte {}: {}", offset, what))
}

/// Parse every member of a newc archive.
///
/// Concatenated archives (separated by zero padding) are read in sequence.
/// The trailer members themselves are not returned.
pub fn read_archive(bytes: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    let mut first = true;

    loop {
        while !first && pos < bytes.len() && bytes[pos] == 0 {
            pos += 1;
        }
        if !first && pos >= bytes.len() {
            break;
        }
        let rest = bytes.get(pos..).unwrap_or(&[]);
        if first || rest.starts_with(NEWC_MAGIC) || rest.starts_with(NEWC_CRC_MAGIC) {
            let (mut archive, next) = read_one(bytes, pos)?;
            entries.append(&mut archive);
            pos = next;
            first = false;
        } else {
            tracing::warn!(offset = pos, "ignoring trailing non-cpio data in initramfs");
            break;
        }
    }

    Ok(entries)
}

/// Read members from `start` up to and including the trailer.
fn read_one(bytes: &[u8], start: usize) -> Result<(Vec<Entry>, usize)> {
    let mut entries = Vec::new();
    let mut pos = start;

    loop {
        let rest = bytes.get(pos..).unwrap_or(&[]);
        let magic = &rest[..rest.len().min(6)];
        if magic != NEWC_MAGIC && magic != NEWC_CRC_MAGIC {
            if magic.is_empty() {
                return Err(corrupt(pos, "missing trailer"));
            }
            return Err(corrupt(
                pos,
                format!(
                    "bad magic {:?} (not a newc archive)",
                    String::from_utf8_lossy(magic)
                ),
            ));
        }
        let header = bytes
            .get(pos..pos + HEADER_LEN)
            .ok_or_else(|| corrupt(pos, "truncated header"))?;

        let mut fields = [0u32; FIELD_COUNT];
        for (i, field) in fields.iter_mut().enumerate() {
            let raw = &header[6 + i * 8..6 + (i + 1) * 8];
            let text = std::str::from_utf8(raw).map_err(|_| corrupt(pos, "non-ASCII header"))?;
            *field = u32::from_str_radix(text, 16)
                .map_err(|_| corrupt(pos, format!("bad hex field {:?}", text)))?;
        }
        let [ino, mode, uid, gid, nlink, mtime, filesize, dev_major, dev_minor, rdev_major, rdev_minor, namesize, _check] =
            fields;

        let name_start = pos + HEADER_LEN;
        let namesize = namesize as usize;
        if namesize == 0 {
            return Err(corrupt(pos, "empty name"));
        }
        let name_bytes = bytes
            .get(name_start..name_start + namesize)
            .ok_or_else(|| corrupt(pos, "truncated name"))?;
        let name = OsStr::from_bytes(&name_bytes[..namesize - 1]).to_os_string();

        let data_start = align4(name_start + namesize);
        let filesize = filesize as usize;
        let data = bytes
            .get(data_start..data_start + filesize)
            .ok_or_else(|| corrupt(pos, format!("truncated data for {:?}", name)))?;
        pos = align4(data_start + filesize);

        if name.as_bytes() == TRAILER.as_bytes() {
            return Ok((entries, pos));
        }

        entries.push(Entry {
            path: name,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            ino,
            dev_major,
            dev_minor,
            rdev_major,
            rdev_minor,
            data: data.to_vec(),
        });
    }
}

/// Streaming newc writer.
pub struct Writer<W: Write> {
    inner: W,
    written: usize,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn append(&mut self, entry: &Entry) -> io::Result<()> {
        self.write_member(entry, &entry.path)
    }

    /// Write the trailer and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        let trailer = Entry {
            nlink: 1,
            ..Default::default()
        };
        self.write_member(&trailer, OsStr::new(TRAILER))?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_member(&mut self, entry: &Entry, name: &OsStr) -> io::Result<()> {
        let filesize = u32::try_from(entry.data.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is too large for a cpio member", name),
            )
        })?;
        let namesize = name.as_bytes().len() + 1;

        let mut header = String::with_capacity(HEADER_LEN);
        header.push_str("070701");
        for value in [
            entry.ino,
            entry.mode,
            entry.uid,
            entry.gid,
            entry.nlink,
            entry.mtime,
            filesize,
            entry.dev_major,
            entry.dev_minor,
            entry.rdev_major,
            entry.rdev_minor,
            namesize as u32,
            0,
        ] {
            header.push_str(&format!("{:08x}", value));
        }

        self.write_all(header.as_bytes())?;
        self.write_all(name.as_bytes())?;
        self.write_all(&[0])?;
        self.pad()?;
        self.write_all(&entry.data)?;
        self.pad()
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.written += buf.len();
        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        let n = pad4(self.written);
        self.write_all(&[0u8; 3][..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(entries: &[Entry]) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        for e in entries {
            writer.append(e).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_header_layout() {
        let bytes = archive(&[Entry::file("init", 0o755, "#!/bin/sh\n")]);
        assert_eq!(&bytes[..6], b"070701");
        // mode field is the second one
        assert_eq!(&bytes[14..22], b"000081ed");
        // name follows the header, padded so the data starts 4-aligned
        assert_eq!(&bytes[110..115], b"init\0");
        assert_eq!(&bytes[116..126], b"#!/bin/sh\n");
        assert_eq!(bytes.len() % 4, 0);
        let tail = String::from_utf8_lossy(&bytes[bytes.len() - 16..]).into_owned();
        assert!(tail.contains("TRAILER!!!"));
    }

    #[test]
    fn test_read_preserves_metadata() {
        let dev = Entry {
            path: "dev/console".into(),
            mode: S_IFCHR | 0o600,
            nlink: 1,
            rdev_major: 5,
            rdev_minor: 1,
            ..Default::default()
        };
        let entries = vec![
            Entry::dir("bin", 0o755),
            Entry::file("bin/busybox", 0o4755, vec![0x7f, b'E', b'L', b'F', 0]),
            Entry::symlink("bin/sh", 0o777, "busybox"),
            dev,
        ];
        let parsed = read_archive(&archive(&entries)).unwrap();
        assert_eq!(parsed, entries);
        assert_eq!(parsed[2].kind(), Some(EntryKind::Symlink));
        assert_eq!(parsed[1].perm(), 0o4755);
        assert!(parsed[3].kind().unwrap().is_special());
    }

    #[test]
    fn test_reads_concatenated_archives() {
        let mut bytes = archive(&[Entry::file("a", 0o644, "1")]);
        bytes.extend_from_slice(&[0u8; 512]);
        bytes.extend(archive(&[Entry::file("b", 0o644, "2")]));

        let parsed = read_archive(&bytes).unwrap();
        let names: Vec<_> = parsed.iter().map(|e| e.path.to_str().unwrap()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = read_archive(b"\x1f\x8b\x08\x00garbage").unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_rejects_truncated_archive() {
        let bytes = archive(&[Entry::file("a", 0o644, "hello world")]);
        let err = read_archive(&bytes[..120]).unwrap_err();
        assert!(matches!(err, BuildError::Transcode(_)));
    }

    #[test]
    fn test_names_are_kept_byte_for_byte() {
        let name = OsStr::from_bytes(b"./lib/caf\xe9.so");
        let parsed = read_archive(&archive(&[Entry::file(name, 0o644, "x")])).unwrap();
        assert_eq!(parsed[0].path.as_bytes(), b"./lib/caf\xe9.so");
    }

    #[test]
    fn test_reads_crc_variant() {
        let mut bytes = archive(&[Entry::file("a", 0o644, "x")]);
        bytes[5] = b'2';
        let parsed = read_archive(&bytes).unwrap();
        assert_eq!(parsed[0].path, "a");
    }
}
