use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::content::{CachedFile, ContentCache};
use crate::read::prefetch::Prefetcher;
use crate::read::random_reader::RandomReader;
use crate::read::{ReadError, ReadOptions, ReadResponse};
use crate::store::ObjectReader;

/// A reader that serves from the content cache when it can.
///
/// Every decision is made against the generation pinned by the wrapped
/// [`RandomReader`]: a cache entry stamped with any other generation pair is
/// stale and gets evicted.
pub struct ReadManager<R: ObjectReader> {
    bucket: String,
    reader: Arc<RandomReader<R>>,
    prefetcher: Option<Prefetcher<R>>,
    cache: Option<Arc<Mutex<ContentCache>>>,
    cache_max_object_size: u64,
}

impl<R: ObjectReader> ReadManager<R> {
    /// Build a manager around `reader` according to `options`.
    pub fn new(bucket: impl Into<String>, reader: RandomReader<R>, options: &ReadOptions) -> Self {
        let reader = Arc::new(reader);
        let prefetcher = options
            .prefetch
            .as_ref()
            .map(|pool| Prefetcher::new(Arc::clone(&reader), Arc::clone(pool)));
        Self {
            bucket: bucket.into(),
            reader,
            prefetcher,
            cache: options.content_cache.clone(),
            cache_max_object_size: options.cache_max_object_size,
        }
    }

    /// The pinned reader.
    #[must_use]
    pub fn reader(&self) -> &RandomReader<R> {
        &self.reader
    }

    /// The read-ahead helper, when one is configured.
    #[must_use]
    pub fn prefetcher(&self) -> Option<&Prefetcher<R>> {
        self.prefetcher.as_ref()
    }

    /// Read up to `len` bytes at `offset`.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<ReadResponse, ReadError> {
        if let Some(cache) = &self.cache
            && let Some(file) = self.cached_file(cache).await?
        {
            match file.read_at(offset, len).await {
                Ok(data) => {
                    let eof = data.len() < len;
                    return Ok(ReadResponse { data, eof });
                }
                // Another handle evicted the entry after we looked it up.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(object = %self.reader.object().name, "cache entry vanished, reading remotely");
                }
                Err(source) => {
                    return Err(ReadError::Transfer {
                        context: "ReadManager::read_at(cached)",
                        source,
                    });
                }
            }
        }

        match &self.prefetcher {
            Some(prefetcher) => prefetcher.read_at(offset, len).await,
            None => self.reader.read_at(offset, len).await,
        }
    }

    /// Find a cache entry valid for the pinned generation, filling the cache
    /// on a miss when the object is small enough.
    ///
    /// The cache lock is never held across the download.
    async fn cached_file(
        &self,
        cache: &Mutex<ContentCache>,
    ) -> Result<Option<CachedFile>, ReadError> {
        let object = self.reader.object();
        let generation = self.reader.generation();
        {
            let mut guard = cache.lock().await;
            match guard.get(&self.bucket, &object.name) {
                Some(file) if file.validate_generation(generation.object, generation.metadata) => {
                    return Ok(Some(file.clone()));
                }
                Some(file) => {
                    debug!(
                        object = %object.name,
                        cached = file.generation(),
                        pinned = generation.object,
                        "evicting stale cache entry"
                    );
                    guard.remove(&self.bucket, &object.name).await;
                }
                None => {}
            }
        }

        let size = self.reader.size();
        if size > self.cache_max_object_size {
            return Ok(None);
        }

        let contents = self.download(size).await?;

        let mut guard = cache.lock().await;
        match guard
            .add_or_replace(
                &self.bucket,
                &object.name,
                generation.object,
                generation.metadata,
                &contents,
            )
            .await
        {
            Ok(file) => Ok(Some(file.clone())),
            Err(e) => {
                // Caching is an optimization; fall back to remote reads.
                warn!(object = %object.name, error = %e, "failed to populate content cache");
                Ok(None)
            }
        }
    }

    async fn download(&self, size: u64) -> Result<bytes::Bytes, ReadError> {
        let data = self.reader.read_at(0, usize::try_from(size).unwrap_or(usize::MAX)).await?;
        Ok(data.data)
    }

    /// Self-check run under the owning handle's lock.
    pub fn check_invariants(&self) -> Result<(), ReadError> {
        self.reader.check_invariants()
    }

    /// Stop read-ahead and release the pinned reader. Idempotent.
    pub fn destroy(&self) {
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.destroy();
        }
        self.reader.destroy();
    }
}
