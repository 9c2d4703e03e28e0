//! Interfaces to the remote object store.
//!
//! The network client, its RPCs and its retry policy live behind these traits.
//! The core only needs paged listings, ranged reads pinned to a generation, and
//! a whole-object upload for `sync`.

use std::collections::BTreeMap;
use std::future::Future;

use bytes::Bytes;

use crate::fs::{DirEntry, EntryType, MinObject};

/// A ranged reader pinned to one object generation.
///
/// Returned by [`ObjectStore::new_reader`]. Construction must not perform I/O:
/// it happens while the inode lock is held.
pub trait ObjectReader: Send + Sync + 'static {
    /// Read up to `len` bytes starting at byte `offset`.
    ///
    /// May return fewer bytes than requested. An error of kind
    /// [`std::io::ErrorKind::UnexpectedEof`] signals end-of-stream.
    fn read(
        &self,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Bytes, std::io::Error>> + Send;

    /// Release any resources held by this reader.
    ///
    /// Reads already in flight when this is called must still complete
    /// against the pinned generation. The default implementation is a no-op.
    fn close(&self) {}
}

/// The remote object store.
pub trait ObjectStore: Clone + Send + Sync + 'static {
    /// The reader type returned by [`new_reader`](Self::new_reader).
    type Reader: ObjectReader;

    /// Create a reader for exactly `object.generation` of `object.name`.
    fn new_reader(&self, bucket: &str, object: &MinObject) -> Self::Reader;

    /// Upload `contents` as `name`, replacing the current generation.
    ///
    /// Returns the newly created object record.
    fn create_object(
        &self,
        bucket: &str,
        name: &str,
        contents: Bytes,
    ) -> impl Future<Output = Result<MinObject, std::io::Error>> + Send;
}

/// Richer per-entry metadata returned by [`ListingSource::read_entry_cores`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCore {
    /// Full object name (or prefix, for directories).
    pub full_name: String,
    /// Entry type.
    pub kind: EntryType,
    /// Backing object, absent for implicit directories.
    pub object: Option<MinObject>,
}

/// The listing side of a directory inode.
///
/// An empty continuation token means there are no further pages.
pub trait ListingSource: Send + Sync + 'static {
    /// Fetch one page of plain entries.
    fn read_entries(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<(Vec<DirEntry>, String), std::io::Error>> + Send;

    /// Fetch one page of entry cores, keyed by entry name.
    fn read_entry_cores(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<(BTreeMap<String, EntryCore>, String), std::io::Error>> + Send;
}
