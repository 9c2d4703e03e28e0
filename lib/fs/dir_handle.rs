//! Per-open-directory listing state.
//!
//! A [`DirHandle`] buffers one epoch of a directory listing. The epoch starts
//! when the kernel reads at offset 0 (there is no explicit rewind signal in
//! the protocol) and lasts until the next offset-0 read. Within an epoch
//! offsets are stable, so the kernel can resume a partially filled buffer.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::fs::dirent::{write_dirent, write_direntplus};
use crate::fs::reconcile::{ReconcileError, reconcile};
use crate::fs::{DirEntry, DirEntryPlus, io_to_errno};
use crate::store::{EntryCore, ListingSource};

#[derive(Debug, Error)]
pub enum ReaddirError {
    #[error("{context}: {source}")]
    Fetch {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("offset {offset} is past the {len} buffered entries")]
    InvalidSeek { offset: u64, len: usize },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl From<ReaddirError> for i32 {
    fn from(e: ReaddirError) -> Self {
        match e {
            ReaddirError::Fetch { ref source, .. } => io_to_errno(source),
            ReaddirError::InvalidSeek { .. } => libc::EINVAL,
            ReaddirError::Reconcile(inner) => inner.into(),
        }
    }
}

/// A kernel directory read request.
///
/// `dst` is the reply buffer; `bytes_read` is how much of it has been filled.
#[derive(Debug)]
pub struct ReadDirOp<'a> {
    /// Offset of the first entry to return.
    pub offset: u64,
    /// Destination buffer.
    pub dst: &'a mut [u8],
    /// Bytes written into `dst` so far.
    pub bytes_read: usize,
}

impl<'a> ReadDirOp<'a> {
    /// A fresh request at `offset` writing into `dst`.
    pub fn new(offset: u64, dst: &'a mut [u8]) -> Self {
        Self {
            offset,
            dst,
            bytes_read: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Listing {
    entries: Vec<DirEntry>,
    entries_valid: bool,
    entries_plus: Vec<DirEntryPlus>,
    entries_plus_valid: bool,
}

impl Listing {
    fn restart(&mut self) {
        self.entries.clear();
        self.entries_valid = false;
        self.entries_plus.clear();
        self.entries_plus_valid = false;
    }
}

/// State for one open directory.
///
/// `dir` is the directory inode's listing source behind its exclusive lock,
/// shared with every other handle on the same directory. The handle's own
/// buffers sit behind a separate lock that is never held by anyone else.
pub struct DirHandle<L: ListingSource> {
    dir: Arc<Mutex<L>>,
    listing: Mutex<Listing>,
}

impl<L: ListingSource> DirHandle<L> {
    /// Open a handle on `dir`. Nothing is fetched until the first read.
    pub fn new(dir: Arc<Mutex<L>>) -> Self {
        Self {
            dir,
            listing: Mutex::new(Listing::default()),
        }
    }

    /// Fetch every page of the remote listing, holding the directory lock for
    /// the fetch loop only.
    async fn fetch_all_entries(&self) -> Result<Vec<DirEntry>, ReaddirError> {
        let dir = self.dir.lock().await;
        let mut entries = Vec::new();
        let mut token = String::new();
        loop {
            let (page, next) =
                dir.read_entries(&token)
                    .await
                    .map_err(|source| ReaddirError::Fetch {
                        context: "DirHandle::fetch_all_entries",
                        source,
                    })?;
            debug!(count = page.len(), more = !next.is_empty(), "fetched listing page");
            entries.extend(page);
            if next.is_empty() {
                return Ok(entries);
            }
            token = next;
        }
    }

    async fn ensure_entries_locked(
        &self,
        listing: &mut Listing,
        local: &BTreeMap<String, DirEntry>,
    ) -> Result<(), ReaddirError> {
        let remote = self.fetch_all_entries().await?;
        let entries = reconcile(remote, local)?;
        debug!(count = entries.len(), local = local.len(), "directory listing populated");
        listing.entries = entries;
        listing.entries_valid = true;
        Ok(())
    }

    /// Fetch and reconcile the full listing, replacing the buffered entries.
    ///
    /// All-or-nothing: on error, or if the returned future is dropped, the
    /// previously buffered entries are left untouched.
    pub async fn ensure_entries(
        &self,
        local: &BTreeMap<String, DirEntry>,
    ) -> Result<(), ReaddirError> {
        let mut listing = self.listing.lock().await;
        self.ensure_entries_locked(&mut listing, local).await
    }

    /// Serve a directory read.
    ///
    /// Offset 0 restarts the epoch and always refetches. Entries are written
    /// until the next one no longer fits; `op.bytes_read` reports how far the
    /// buffer got.
    #[instrument(name = "DirHandle::read_dir", skip(self, op, local), fields(offset = op.offset))]
    pub async fn read_dir(
        &self,
        op: &mut ReadDirOp<'_>,
        local: &BTreeMap<String, DirEntry>,
    ) -> Result<(), ReaddirError> {
        let mut listing = self.listing.lock().await;
        if op.offset == 0 {
            listing.restart();
        }
        if !listing.entries_valid {
            self.ensure_entries_locked(&mut listing, local).await?;
        }
        fill(op, &listing.entries, write_dirent)
    }

    /// Serve a directory read with attributes.
    ///
    /// `entries` and `local` are fetched by the caller. They are reconciled
    /// at most once per epoch: once the attribute-bearing sequence is valid,
    /// later calls serve it as is and ignore their inputs until the next
    /// offset-0 restart.
    #[instrument(
        name = "DirHandle::read_dir_plus",
        skip(self, op, entries, local),
        fields(offset = op.offset)
    )]
    pub async fn read_dir_plus(
        &self,
        op: &mut ReadDirOp<'_>,
        entries: Vec<DirEntryPlus>,
        local: &BTreeMap<String, DirEntryPlus>,
    ) -> Result<(), ReaddirError> {
        let mut listing = self.listing.lock().await;
        if op.offset == 0 {
            listing.restart();
        }
        if !listing.entries_plus_valid {
            listing.entries_plus = reconcile(entries, local)?;
            listing.entries_plus_valid = true;
        }
        fill(op, &listing.entries_plus, write_direntplus)
    }

    /// Fetch every page of entry cores for the directory.
    ///
    /// The result belongs to the caller; it does not touch the buffered
    /// entries.
    pub async fn fetch_entry_cores(&self) -> Result<BTreeMap<String, EntryCore>, ReaddirError> {
        let dir = self.dir.lock().await;
        let mut cores = BTreeMap::new();
        let mut token = String::new();
        loop {
            let (page, next) =
                dir.read_entry_cores(&token)
                    .await
                    .map_err(|source| ReaddirError::Fetch {
                        context: "DirHandle::fetch_entry_cores",
                        source,
                    })?;
            cores.extend(page);
            if next.is_empty() {
                return Ok(cores);
            }
            token = next;
        }
    }

    /// A copy of the buffered plain entries. Empty when invalid.
    pub async fn entries(&self) -> Vec<DirEntry> {
        self.listing.lock().await.entries.clone()
    }
}

/// Write `entries[op.offset..]` into the op's buffer until one does not fit.
fn fill<T>(
    op: &mut ReadDirOp<'_>,
    entries: &[T],
    write: fn(&mut [u8], &T) -> usize,
) -> Result<(), ReaddirError> {
    let len = entries.len();
    let start = usize::try_from(op.offset)
        .ok()
        .filter(|start| *start <= len)
        .ok_or(ReaddirError::InvalidSeek {
            offset: op.offset,
            len,
        })?;

    for entry in &entries[start..] {
        // A caller-supplied `bytes_read` past the end leaves no room.
        let Some(room) = op.dst.get_mut(op.bytes_read..) else {
            break;
        };
        let n = write(room, entry);
        if n == 0 {
            break;
        }
        op.bytes_read += n;
    }
    Ok(())
}
