//! The file inode as seen by the read path.
//!
//! A [`FileInode`] is shared by every handle open on the same file and is the
//! single source of truth for which object generation reads should see. While
//! it holds a local copy of the content (after a write, or when range reads are
//! served from a local copy) that copy takes precedence and the remote
//! generation is no longer authoritative.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::fs::{InodeId, MinObject, OpenFlags, SourceGeneration};
use crate::read::{ReadResponse, read_full};
use crate::store::{ObjectReader as _, ObjectStore};

/// Mutable inode state, guarded by the inode lock.
#[derive(Debug)]
pub struct InodeState {
    source: MinObject,
    content: Option<Vec<u8>>,
    /// Set by writes; a clean local copy is never uploaded.
    dirty: bool,
}

impl InodeState {
    /// The remote object this inode was last synced with.
    #[must_use]
    pub fn source(&self) -> &MinObject {
        &self.source
    }

    /// Generation pair of [`source`](Self::source).
    #[must_use]
    pub fn source_generation(&self) -> SourceGeneration {
        self.source.source_generation()
    }

    /// Whether reads may be served from `source`'s generation.
    ///
    /// False while a local copy of the content exists.
    #[must_use]
    pub fn source_generation_is_authoritative(&self) -> bool {
        self.content.is_none()
    }

    /// Whether the local copy holds writes not yet synced.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Size reads should observe: the local copy's when dirty.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.content
            .as_ref()
            .map_or(self.source.size, |c| c.len() as u64)
    }
}

/// Open handles registered on an inode, split by intent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandleCounts {
    /// Handles that may only read.
    pub readers: usize,
    /// Handles that may write.
    pub writers: usize,
}

/// A file inode backed by one remote object.
pub struct FileInode<S: ObjectStore> {
    id: InodeId,
    bucket: String,
    store: S,
    cache_file_for_range_read: bool,
    state: Arc<Mutex<InodeState>>,
    handles: parking_lot::Mutex<HandleCounts>,
}

impl<S: ObjectStore> FileInode<S> {
    /// Create an inode for `source`, clean and authoritative.
    ///
    /// With `cache_file_for_range_read`, the first read pulls the whole object
    /// into a local copy and all reads are served from it.
    pub fn new(
        id: InodeId,
        bucket: impl Into<String>,
        source: MinObject,
        store: S,
        cache_file_for_range_read: bool,
    ) -> Self {
        Self {
            id,
            bucket: bucket.into(),
            store,
            cache_file_for_range_read,
            state: Arc::new(Mutex::new(InodeState {
                source,
                content: None,
                dirty: false,
            })),
            handles: parking_lot::Mutex::new(HandleCounts::default()),
        }
    }

    /// This inode's identifier.
    #[must_use]
    pub fn id(&self) -> InodeId {
        self.id
    }

    /// Bucket holding the backing object.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The object store this inode reads from.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Acquire the inode lock.
    pub async fn lock(&self) -> OwnedMutexGuard<InodeState> {
        Arc::clone(&self.state).lock_owned().await
    }

    /// Record an open handle's read or write intent.
    pub fn register_handle(&self, flags: OpenFlags) {
        let mut counts = self.handles.lock();
        if flags.is_read_only() {
            counts.readers += 1;
        } else {
            counts.writers += 1;
        }
    }

    /// Drop an open handle's read or write intent.
    pub fn deregister_handle(&self, flags: OpenFlags) {
        let mut counts = self.handles.lock();
        let slot = if flags.is_read_only() {
            &mut counts.readers
        } else {
            &mut counts.writers
        };
        debug_assert!(*slot > 0, "deregistering a handle that was never registered");
        *slot = slot.saturating_sub(1);
    }

    /// Current open-handle accounting.
    #[must_use]
    pub fn handle_counts(&self) -> HandleCounts {
        *self.handles.lock()
    }

    /// Pull the whole object into a local copy if one is missing.
    async fn ensure_content(&self, state: &mut InodeState) -> Result<(), std::io::Error> {
        if state.content.is_some() {
            return Ok(());
        }
        let reader = self.store.new_reader(&self.bucket, &state.source);
        let data = read_full(&reader, state.source.size).await;
        reader.close();
        let data = data?;
        debug!(
            inode = self.id,
            generation = state.source.generation,
            len = data.len(),
            "materialized local content"
        );
        state.content = Some(data.to_vec());
        Ok(())
    }

    /// Materialize the local copy when range reads are configured to be
    /// served from it. Leaves the inode non-authoritative in that case.
    pub async fn ensure_cached_content(
        &self,
        state: &mut InodeState,
    ) -> Result<(), std::io::Error> {
        if self.cache_file_for_range_read {
            self.ensure_content(state).await?;
        }
        Ok(())
    }

    /// The inode's own read path: serve from the local copy, creating it
    /// first if needed.
    pub async fn read_locked(
        &self,
        state: &mut InodeState,
        offset: u64,
        len: usize,
    ) -> Result<ReadResponse, std::io::Error> {
        self.ensure_content(state).await?;
        let content = state.content.as_deref().unwrap_or_default();
        Ok(ReadResponse::from_slice(content, offset, len))
    }

    /// Write `data` at `offset` into the local copy, making the inode dirty.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<(), std::io::Error> {
        let mut state = self.lock().await;
        self.ensure_content(&mut state).await?;
        let content = state.content.get_or_insert_with(Vec::new);
        let start = usize::try_from(offset)
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EFBIG))?;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        state.dirty = true;
        Ok(())
    }

    /// Upload the local copy, adopting the new generation as authoritative.
    ///
    /// Returns `false` when there was nothing to upload. A local copy that was
    /// only materialized for reading is left in place and not uploaded.
    pub async fn sync(&self) -> Result<bool, std::io::Error> {
        let mut state = self.lock().await;
        let Some(content) = state.content.as_ref().filter(|_| state.dirty) else {
            return Ok(false);
        };
        let object = self
            .store
            .create_object(&self.bucket, &state.source.name, Bytes::from(content.clone()))
            .await?;
        debug!(
            inode = self.id,
            from = state.source.generation,
            to = object.generation,
            "synced local content"
        );
        state.source = object;
        state.content = None;
        state.dirty = false;
        Ok(true)
    }

    /// Adopt fresher remote metadata for a clean inode, dropping any clean
    /// local copy of the previous generation.
    ///
    /// Ignored while the inode is dirty: local modifications win until synced.
    pub async fn refresh_source(&self, object: MinObject) {
        let mut state = self.lock().await;
        if state.dirty {
            return;
        }
        if state.source.source_generation() != object.source_generation() {
            state.content = None;
        }
        state.source = object;
    }
}
