//! Directory records and their kernel wire encoding.
//!
//! Both record kinds follow the FUSE layout: a fixed header, the name bytes,
//! then zero padding up to the next 8-byte boundary. Writers never emit a
//! partial record: if the whole record does not fit in the destination they
//! write nothing and return 0, so callers can stop and resume later from the
//! entry's offset.

use crate::fs::{EntryType, InodeId};

/// Size of the fixed `fuse_dirent` header preceding the name.
const DIRENT_HEADER_LEN: usize = 24;

/// Size of the `fuse_entry_out` block preceding the dirent in a direntplus.
const ENTRY_OUT_LEN: usize = 128;

/// A directory entry as served to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Offset of the entry that follows this one. 1-based within an epoch.
    pub offset: u64,
    /// Inode identifier reported for this entry.
    pub inode: InodeId,
    /// Entry name. Rewritten only by conflict repair.
    pub name: String,
    /// Entry type.
    pub kind: EntryType,
}

impl DirEntry {
    /// An entry with no offset or inode assigned yet.
    pub fn new(name: impl Into<String>, kind: EntryType) -> Self {
        Self {
            offset: 0,
            inode: 0,
            name: name.into(),
            kind,
        }
    }
}

/// Attributes carried alongside a [`DirEntryPlus`] so the kernel can skip a
/// follow-up `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryAttrs {
    /// Size in bytes.
    pub size: u64,
    /// Full `st_mode`, including the file type bits.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Identifier of the child inode.
    pub child: InodeId,
}

/// A directory entry augmented with cached attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryPlus {
    /// The plain entry.
    pub entry: DirEntry,
    /// Attributes of the child.
    pub attrs: EntryAttrs,
}

impl DirEntryPlus {
    /// An entry with no offset or inode assigned yet.
    pub fn new(name: impl Into<String>, kind: EntryType, attrs: EntryAttrs) -> Self {
        Self {
            entry: DirEntry::new(name, kind),
            attrs,
        }
    }
}

fn aligned(len: usize) -> usize {
    (len + 7) & !7
}

fn put_u64(dst: &mut [u8], at: usize, v: u64) {
    dst[at..at + 8].copy_from_slice(&v.to_ne_bytes());
}

fn put_u32(dst: &mut [u8], at: usize, v: u32) {
    dst[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

/// Encode `entry` as a `fuse_dirent` at the start of `dst`.
///
/// Returns the number of bytes written, or 0 when the record does not fit.
#[must_use]
pub fn write_dirent(dst: &mut [u8], entry: &DirEntry) -> usize {
    let name = entry.name.as_bytes();
    let Ok(namelen) = u32::try_from(name.len()) else {
        return 0;
    };
    let total = aligned(DIRENT_HEADER_LEN + name.len());
    if total > dst.len() {
        return 0;
    }

    put_u64(dst, 0, entry.inode);
    put_u64(dst, 8, entry.offset);
    put_u32(dst, 16, namelen);
    put_u32(dst, 20, entry.kind.d_type());
    let name_end = DIRENT_HEADER_LEN + name.len();
    dst[DIRENT_HEADER_LEN..name_end].copy_from_slice(name);
    dst[name_end..total].fill(0);
    total
}

/// Encode `entry` as a `fuse_direntplus` at the start of `dst`.
///
/// Validity timeouts are left at zero so the kernel revalidates through
/// `lookup`. Returns the number of bytes written, or 0 when the record does
/// not fit.
#[must_use]
pub fn write_direntplus(dst: &mut [u8], entry: &DirEntryPlus) -> usize {
    let total = ENTRY_OUT_LEN + aligned(DIRENT_HEADER_LEN + entry.entry.name.len());
    if total > dst.len() {
        return 0;
    }

    let attrs = &entry.attrs;
    let head = &mut dst[..ENTRY_OUT_LEN];
    head.fill(0);
    // fuse_entry_out: nodeid, generation, entry_valid, attr_valid, nsecs.
    put_u64(head, 0, attrs.child);
    // fuse_attr starts at 40: ino, size, blocks, three times, three nsecs,
    // then mode and nlink.
    put_u64(head, 40, attrs.child);
    put_u64(head, 48, attrs.size);
    put_u64(head, 56, attrs.size.div_ceil(512));
    put_u32(head, 100, attrs.mode);
    put_u32(head, 104, attrs.nlink);

    let written = write_dirent(&mut dst[ENTRY_OUT_LEN..], &entry.entry);
    if written == 0 {
        return 0;
    }
    ENTRY_OUT_LEN + written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u64(src: &[u8], at: usize) -> u64 {
        u64::from_ne_bytes(src[at..at + 8].try_into().unwrap_or([0; 8]))
    }

    fn read_u32(src: &[u8], at: usize) -> u32 {
        u32::from_ne_bytes(src[at..at + 4].try_into().unwrap_or([0; 4]))
    }

    fn entry(name: &str, offset: u64) -> DirEntry {
        DirEntry {
            offset,
            inode: 2,
            name: name.to_owned(),
            kind: EntryType::File,
        }
    }

    #[test]
    fn dirent_is_padded_to_eight_bytes() {
        let mut buf = [0xffu8; 64];
        let n = write_dirent(&mut buf, &entry("abc", 1));
        assert_eq!(n, 32, "24 byte header + 3 byte name rounds up to 32");
        assert_eq!(read_u64(&buf, 0), 2);
        assert_eq!(read_u64(&buf, 8), 1);
        assert_eq!(read_u32(&buf, 16), 3);
        assert_eq!(read_u32(&buf, 20), u32::from(libc::DT_REG));
        assert_eq!(&buf[24..27], b"abc");
        assert!(buf[27..32].iter().all(|b| *b == 0), "padding must be zeroed");
        assert_eq!(buf[32], 0xff, "bytes past the record are untouched");
    }

    #[test]
    fn dirent_exact_fit_is_written() {
        let mut buf = [0u8; 32];
        assert_eq!(write_dirent(&mut buf, &entry("12345678", 4)), 32);
    }

    #[test]
    fn dirent_that_does_not_fit_writes_nothing() {
        let mut buf = [0xaau8; 31];
        assert_eq!(write_dirent(&mut buf, &entry("12345678", 4)), 0);
        assert!(buf.iter().all(|b| *b == 0xaa));
    }

    #[test]
    fn direntplus_carries_attributes() {
        let plus = DirEntryPlus {
            entry: entry("f", 7),
            attrs: EntryAttrs {
                size: 1000,
                mode: libc::S_IFREG | 0o644,
                nlink: 1,
                child: 42,
            },
        };
        let mut buf = [0u8; 256];
        let n = write_direntplus(&mut buf, &plus);
        assert_eq!(n, 128 + 32);
        assert_eq!(read_u64(&buf, 0), 42, "nodeid");
        assert_eq!(read_u64(&buf, 48), 1000, "size");
        assert_eq!(read_u64(&buf, 56), 2, "blocks");
        assert_eq!(read_u32(&buf, 100), libc::S_IFREG | 0o644, "mode");
        assert_eq!(read_u32(&buf, 104), 1, "nlink");
        assert_eq!(read_u64(&buf, 128 + 8), 7, "dirent offset");
    }

    #[test]
    fn direntplus_that_does_not_fit_writes_nothing() {
        let plus = DirEntryPlus::new("f", EntryType::File, EntryAttrs::default());
        let mut buf = [0u8; 150];
        assert_eq!(write_direntplus(&mut buf, &plus), 0);
    }
}
