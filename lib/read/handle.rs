//! Per-open-file read state.
//!
//! Each [`FileHandle`] owns at most one reader binding, pinned to the object
//! generation that was authoritative when it was built. Every read first
//! decides, under the handle lock and then the inode lock, whether that binding
//! is still good. The bytes are then moved with no lock held.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, trace};

use crate::fs::inode::InodeState;
use crate::fs::{FileInode, OpenFlags, SourceGeneration};
use crate::read::{RandomReader, ReadError, ReadManager, ReadOptions, ReadResponse};
use crate::store::{ObjectReader, ObjectStore};

/// A reader pinned to one generation of the handle's object.
pub enum ReaderBinding<R: ObjectReader> {
    /// Plain ranged reads.
    Random(RandomReader<R>),
    /// Reads through the content cache and read-ahead.
    Managed(ReadManager<R>),
}

impl<R: ObjectReader> ReaderBinding<R> {
    /// The underlying pinned reader.
    #[must_use]
    pub fn reader(&self) -> &RandomReader<R> {
        match self {
            Self::Random(reader) => reader,
            Self::Managed(manager) => manager.reader(),
        }
    }

    /// The pinned generation pair.
    #[must_use]
    pub fn generation(&self) -> SourceGeneration {
        self.reader().generation()
    }

    /// Refresh the object size seen by this binding.
    pub fn set_object_size(&self, size: u64) {
        self.reader().set_size(size);
    }

    /// Read up to `len` bytes at `offset`.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<ReadResponse, ReadError> {
        match self {
            Self::Random(reader) => reader.read_at(offset, len).await,
            Self::Managed(manager) => manager.read_at(offset, len).await,
        }
    }

    pub fn check_invariants(&self) -> Result<(), ReadError> {
        match self {
            Self::Random(reader) => reader.check_invariants(),
            Self::Managed(manager) => manager.check_invariants(),
        }
    }

    /// Tear the binding down. Idempotent.
    pub fn destroy(&self) {
        match self {
            Self::Random(reader) => reader.destroy(),
            Self::Managed(manager) => manager.destroy(),
        }
    }
}

/// Where a read goes, decided under the locks.
pub enum ReadPath<R: ObjectReader> {
    /// The inode holds local content; read it while keeping the inode lock.
    Inode(OwnedMutexGuard<InodeState>),
    /// Transfer through this binding with no lock held.
    Reader(Arc<ReaderBinding<R>>),
}

struct HandleState<R: ObjectReader> {
    binding: Option<Arc<ReaderBinding<R>>>,
    destroyed: bool,
}

/// State for one open file.
pub struct FileHandle<S: ObjectStore> {
    inode: Arc<FileInode<S>>,
    flags: OpenFlags,
    options: ReadOptions,
    state: Mutex<HandleState<S::Reader>>,
}

impl<S: ObjectStore> FileHandle<S> {
    /// Open a handle on `inode`, registering its read/write intent.
    ///
    /// No reader is created until the first read.
    pub fn open(inode: Arc<FileInode<S>>, flags: OpenFlags, options: ReadOptions) -> Self {
        inode.register_handle(flags);
        Self {
            inode,
            flags,
            options,
            state: Mutex::new(HandleState {
                binding: None,
                destroyed: false,
            }),
        }
    }

    /// The flags this handle was opened with.
    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The inode this handle reads.
    #[must_use]
    pub fn inode(&self) -> &Arc<FileInode<S>> {
        &self.inode
    }

    /// The current binding, if any.
    pub async fn binding(&self) -> Option<Arc<ReaderBinding<S::Reader>>> {
        self.state.lock().await.binding.clone()
    }

    /// Read up to `len` bytes at `offset`.
    ///
    /// A read reaching the end of the object returns a short (possibly empty)
    /// response with `eof` set.
    #[instrument(name = "FileHandle::read", skip(self), fields(inode = self.inode.id()))]
    pub async fn read(&self, offset: u64, len: usize) -> Result<ReadResponse, ReadError> {
        let path = {
            let mut state = self.state.lock().await;
            if state.destroyed {
                return Err(ReadError::Destroyed("file handle"));
            }
            let mut inode = self.inode.lock().await;
            self.inode
                .ensure_cached_content(&mut inode)
                .await
                .map_err(ReadError::Inode)?;
            self.select_path(&mut state, inode)
        };

        match path {
            ReadPath::Inode(mut inode) => self
                .inode
                .read_locked(&mut inode, offset, len)
                .await
                .map_err(ReadError::Inode),
            ReadPath::Reader(binding) => binding.read_at(offset, len).await,
        }
    }

    /// Decide which path serves the next read.
    ///
    /// Runs with the handle lock held and consumes the inode lock: it is
    /// handed back inside [`ReadPath::Inode`], or dropped before returning a
    /// reader.
    fn select_path(
        &self,
        state: &mut HandleState<S::Reader>,
        inode: OwnedMutexGuard<InodeState>,
    ) -> ReadPath<S::Reader> {
        if !inode.source_generation_is_authoritative() {
            if let Some(binding) = state.binding.take() {
                debug!(
                    generation = binding.generation().object,
                    "inode holds local content, dropping reader"
                );
                binding.destroy();
            }
            return ReadPath::Inode(inode);
        }

        let current = inode.source_generation();
        if let Some(binding) = &state.binding
            && binding.generation() == current
        {
            binding.set_object_size(inode.source().size);
            trace!(generation = current.object, "reusing reader");
            return ReadPath::Reader(Arc::clone(binding));
        }

        if let Some(stale) = state.binding.take() {
            debug!(
                from = stale.generation().object,
                from_meta = stale.generation().metadata,
                to = current.object,
                to_meta = current.metadata,
                "generation changed, rebuilding reader"
            );
            stale.destroy();
        }

        let source = inode.source().clone();
        let reader = RandomReader::new(
            source.clone(),
            self.inode.store().new_reader(self.inode.bucket(), &source),
        );
        let binding = if self.options.wants_manager() {
            ReaderBinding::Managed(ReadManager::new(self.inode.bucket(), reader, &self.options))
        } else {
            ReaderBinding::Random(reader)
        };
        debug!(
            object = %source.name,
            generation = current.object,
            managed = matches!(binding, ReaderBinding::Managed(_)),
            "bound reader"
        );
        let binding = Arc::new(binding);
        state.binding = Some(Arc::clone(&binding));
        ReadPath::Reader(binding)
    }

    /// Run the binding's self-check, if a binding exists.
    pub async fn check_invariants(&self) -> Result<(), ReadError> {
        let state = self.state.lock().await;
        match &state.binding {
            Some(binding) => binding.check_invariants(),
            None => Ok(()),
        }
    }

    /// Tear down any binding and deregister this handle from the inode.
    ///
    /// Safe to call more than once, and before any read.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        if let Some(binding) = state.binding.take() {
            binding.destroy();
        }
        if !state.destroyed {
            state.destroyed = true;
            self.inode.deregister_handle(self.flags);
        }
    }
}
