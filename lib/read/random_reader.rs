use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::BytesMut;
use tracing::trace;

use crate::fs::{MinObject, SourceGeneration};
use crate::read::{ReadError, ReadResponse};
use crate::store::ObjectReader;

/// A ranged reader over one pinned object generation.
///
/// The generation never changes for the lifetime of the reader. Only the
/// object size may be refreshed, since metadata updates can change it without
/// a new content generation.
pub struct RandomReader<R: ObjectReader> {
    object: MinObject,
    size: AtomicU64,
    reader: R,
    destroyed: AtomicBool,
}

impl<R: ObjectReader> RandomReader<R> {
    /// Pin `reader` to `object`.
    pub fn new(object: MinObject, reader: R) -> Self {
        let size = AtomicU64::new(object.size);
        Self {
            object,
            size,
            reader,
            destroyed: AtomicBool::new(false),
        }
    }

    /// The object snapshot this reader was created for.
    #[must_use]
    pub fn object(&self) -> &MinObject {
        &self.object
    }

    /// The pinned generation pair.
    #[must_use]
    pub fn generation(&self) -> SourceGeneration {
        self.object.source_generation()
    }

    /// Current view of the object size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Refresh the object size without changing the pinned generation.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Read up to `len` bytes at `offset`, clamped to the object size.
    ///
    /// A read reaching past the end returns what is there with `eof` set. An
    /// `UnexpectedEof` from the store is treated the same way.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<ReadResponse, ReadError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ReadError::Destroyed("random reader"));
        }
        let size = self.size();
        if offset >= size {
            return Ok(ReadResponse::eof());
        }
        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let want = len.min(available);

        let mut buf = BytesMut::with_capacity(want);
        while buf.len() < want {
            let at = offset + buf.len() as u64;
            match self.reader.read(at, want - buf.len()).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(source) => {
                    return Err(ReadError::Transfer {
                        context: "RandomReader::read_at",
                        source,
                    });
                }
            }
        }
        trace!(
            object = %self.object.name,
            generation = self.object.generation,
            offset,
            n = buf.len(),
            "ranged read"
        );
        let eof = buf.len() < len;
        Ok(ReadResponse {
            data: buf.freeze(),
            eof,
        })
    }

    /// Self-check run under the owning handle's lock.
    pub fn check_invariants(&self) -> Result<(), ReadError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ReadError::Invariant(format!(
                "destroyed reader for {:?} is still bound",
                self.object.name
            )));
        }
        if self.object.name.is_empty() {
            return Err(ReadError::Invariant("reader bound to an unnamed object".to_owned()));
        }
        Ok(())
    }

    /// Release the underlying store reader. Idempotent.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.reader.close();
        }
    }

    /// Whether [`destroy`](Self::destroy) has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}
