//! The read path: per-handle reader bindings pinned to object generations.
/// Per-open-file state and the binding decision.
pub mod handle;
/// Reader that consults the content cache and optional read-ahead.
pub mod manager;
/// Block read-ahead over a pooled set of workers.
pub mod prefetch;
/// Plain ranged reader pinned to one generation.
pub mod random_reader;

pub use handle::{FileHandle, ReadPath, ReaderBinding};
pub use manager::ReadManager;
pub use prefetch::{BlockPool, Prefetcher};
pub use random_reader::RandomReader;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::content::ContentCache;
use crate::fs::io_to_errno;
use crate::store::ObjectReader;

/// Bytes returned by a read, and whether the end of the object was reached.
///
/// End-of-data is not an error: a short read at the end of an object comes
/// back with `eof` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    /// The bytes read.
    pub data: Bytes,
    /// Whether fewer bytes than requested were available.
    pub eof: bool,
}

impl ReadResponse {
    /// An empty end-of-data response.
    #[must_use]
    pub fn eof() -> Self {
        Self {
            data: Bytes::new(),
            eof: true,
        }
    }

    /// Serve `len` bytes at `offset` out of `content`.
    #[must_use]
    pub fn from_slice(content: &[u8], offset: u64, len: usize) -> Self {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
        let end = start.saturating_add(len).min(content.len());
        Self {
            data: Bytes::copy_from_slice(&content[start..end]),
            eof: end - start < len,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("inode read failed: {0}")]
    Inode(#[source] std::io::Error),

    #[error("{context}: {source}")]
    Transfer {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("read on a destroyed {0}")]
    Destroyed(&'static str),

    #[error("reader invariant violated: {0}")]
    Invariant(String),
}

impl From<ReadError> for i32 {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Inode(ref source) | ReadError::Transfer { ref source, .. } => {
                io_to_errno(source)
            }
            ReadError::Destroyed(_) => libc::EBADF,
            ReadError::Invariant(_) => libc::EIO,
        }
    }
}

/// Per-handle read configuration, assembled once at mount time.
///
/// With neither a content cache nor a block pool, handles bind plain
/// [`RandomReader`]s. Otherwise they bind a [`ReadManager`].
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Whole-object cache shared by every handle. The cache does no locking
    /// of its own; this mutex is the only thing serializing access to it.
    pub content_cache: Option<Arc<Mutex<ContentCache>>>,
    /// Objects up to this size are downloaded whole into the content cache.
    pub cache_max_object_size: u64,
    /// Read-ahead resources.
    pub prefetch: Option<Arc<BlockPool>>,
}

impl ReadOptions {
    /// Whether handles should bind a [`ReadManager`].
    #[must_use]
    pub fn wants_manager(&self) -> bool {
        self.content_cache.is_some() || self.prefetch.is_some()
    }
}

/// Read `size` bytes from the start of an object.
///
/// Stops early at end-of-stream, so the result may be shorter than `size` if
/// the object shrank.
pub async fn read_full<R: ObjectReader>(reader: &R, size: u64) -> Result<Bytes, std::io::Error> {
    let want = usize::try_from(size).map_err(|_| std::io::Error::from_raw_os_error(libc::EFBIG))?;
    let mut buf = BytesMut::with_capacity(want);
    while buf.len() < want {
        match reader.read(buf.len() as u64, want - buf.len()).await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(buf.freeze())
}
