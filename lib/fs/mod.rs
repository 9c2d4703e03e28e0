//! Filesystem-facing types shared by the directory and read paths.
/// Kernel directory record encoding.
pub mod dirent;
/// Per-open-directory listing state.
pub mod dir_handle;
/// Minimal file inode consumed by the read path.
pub mod inode;
/// Merge, sort and conflict resolution for directory listings.
pub mod reconcile;

pub use dir_handle::{DirHandle, ReadDirOp, ReaddirError};
pub use dirent::{DirEntry, DirEntryPlus, EntryAttrs};
pub use inode::FileInode;

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeId = u64;

/// Identifier of the mount root.
pub const ROOT_INODE_ID: InodeId = 1;

/// Inode identifier stamped on every listed entry.
///
/// `readdir` does not take kernel references, so real identifiers are minted
/// by `lookup` instead. Any non-root value works here.
pub const PLACEHOLDER_INODE_ID: InodeId = ROOT_INODE_ID + 1;

/// Suffix appended to a file whose name collides with a directory.
///
/// Object names cannot contain a newline, so the suffixed name can never
/// shadow a real object.
pub const CONFLICT_SUFFIX: &str = "\n";

/// Strip [`CONFLICT_SUFFIX`] from a name produced by the reconciler.
///
/// Returns the object name the entry was listed under, and whether the
/// suffix was present.
#[must_use]
pub fn strip_conflict_suffix(name: &str) -> (&str, bool) {
    match name.strip_suffix(CONFLICT_SUFFIX) {
        Some(base) => (base, true),
        None => (name, false),
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;
        /// Append on each write.
        const APPEND = libc::O_APPEND;
    }
}

impl OpenFlags {
    /// Whether a handle opened with these flags may only read.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        !self.intersects(Self::WRONLY | Self::RDWR | Self::APPEND)
    }
}

/// The type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryType {
    /// A directory, explicit or implicit.
    Directory,
    /// A regular file.
    File,
    /// A symbolic link.
    Symlink,
}

impl EntryType {
    /// The `d_type` value the kernel expects for this entry.
    #[must_use]
    pub fn d_type(self) -> u32 {
        let t = match self {
            Self::Directory => libc::DT_DIR,
            Self::File => libc::DT_REG,
            Self::Symlink => libc::DT_LNK,
        };
        u32::from(t)
    }

    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// The version stamp of an object: content generation and metadata generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceGeneration {
    /// Content generation.
    pub object: i64,
    /// Metadata generation.
    pub metadata: i64,
}

/// The subset of remote object metadata the read path needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinObject {
    /// Full object name within the bucket.
    pub name: String,
    /// Size of the object's content in bytes.
    pub size: u64,
    /// Content generation.
    pub generation: i64,
    /// Metadata generation.
    pub meta_generation: i64,
}

impl MinObject {
    /// The generation pair of this object.
    #[must_use]
    pub fn source_generation(&self) -> SourceGeneration {
        SourceGeneration {
            object: self.generation,
            metadata: self.meta_generation,
        }
    }
}

/// Convert an I/O error to the corresponding errno value for kernel replies.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
#[must_use]
pub fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        _ => libc::EIO,
    })
}
