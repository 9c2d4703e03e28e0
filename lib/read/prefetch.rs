//! Block read-ahead.
//!
//! A [`Prefetcher`] splits the object into fixed-size blocks. Each read is
//! served block by block, then the next `depth` blocks are fetched in the
//! background. Background fetches share a [`BlockPool`] semaphore across every
//! handle on the mount, so a burst of sequential readers cannot fan out into
//! an unbounded number of concurrent requests.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::read::random_reader::RandomReader;
use crate::read::{ReadError, ReadResponse};
use crate::store::ObjectReader;

/// Read-ahead resources shared by every handle on a mount.
#[derive(Debug)]
pub struct BlockPool {
    block_size: u64,
    depth: usize,
    workers: Arc<Semaphore>,
}

impl BlockPool {
    /// A pool reading `block_size`-byte blocks, `depth` blocks ahead, with at
    /// most `workers` background fetches in flight.
    #[must_use]
    pub fn new(block_size: u64, depth: usize, workers: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            depth,
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}

type BlockTask = JoinHandle<Result<Bytes, ReadError>>;

/// Read-ahead wrapper around a [`RandomReader`].
pub struct Prefetcher<R: ObjectReader> {
    reader: Arc<RandomReader<R>>,
    pool: Arc<BlockPool>,
    /// Blocks being fetched in the background, by block index.
    pending: scc::HashMap<u64, BlockTask>,
    /// The most recently consumed block.
    current: parking_lot::Mutex<Option<(u64, Bytes)>>,
}

impl<R: ObjectReader> Prefetcher<R> {
    /// Wrap `reader`, drawing workers from `pool`.
    pub fn new(reader: Arc<RandomReader<R>>, pool: Arc<BlockPool>) -> Self {
        Self {
            reader,
            pool,
            pending: scc::HashMap::new(),
            current: parking_lot::Mutex::new(None),
        }
    }

    /// Read up to `len` bytes at `offset`, then schedule read-ahead.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<ReadResponse, ReadError> {
        let size = self.reader.size();
        if offset >= size {
            return Ok(ReadResponse::eof());
        }
        let end = size.min(offset.saturating_add(len as u64));
        let bs = self.pool.block_size;

        let mut out = BytesMut::with_capacity(usize::try_from(end - offset).unwrap_or(0));
        let mut pos = offset;
        while pos < end {
            let index = pos / bs;
            let block = self.block(index).await?;
            let from = usize::try_from(pos - index * bs).unwrap_or(usize::MAX);
            if from >= block.len() {
                // The object is shorter than its recorded size.
                break;
            }
            let take = (block.len() - from).min(usize::try_from(end - pos).unwrap_or(usize::MAX));
            out.extend_from_slice(&block[from..from + take]);
            pos += take as u64;
        }

        self.schedule(end.div_ceil(bs), size);
        let eof = out.len() < len;
        Ok(ReadResponse {
            data: out.freeze(),
            eof,
        })
    }

    /// Fetch block `index`, preferring the current or a prefetched copy.
    async fn block(&self, index: u64) -> Result<Bytes, ReadError> {
        if let Some((i, ref data)) = *self.current.lock()
            && i == index
        {
            return Ok(data.clone());
        }

        let prefetched = match self.pending.remove_sync(&index) {
            Some((_, task)) => match task.await {
                Ok(Ok(data)) => Some(data),
                // A failed or cancelled read-ahead is retried in the foreground.
                Ok(Err(e)) => {
                    debug!(block = index, error = %e, "read-ahead failed, refetching");
                    None
                }
                Err(_) => None,
            },
            None => None,
        };
        let data = match prefetched {
            Some(data) => data,
            None => {
                let bs = self.pool.block_size;
                let block_len = usize::try_from(bs).unwrap_or(usize::MAX);
                self.reader.read_at(index * bs, block_len).await?.data
            }
        };
        *self.current.lock() = Some((index, data.clone()));
        Ok(data)
    }

    /// Start background fetches for up to `depth` blocks from `first`.
    /// Read-ahead outside that window is aborted and dropped, so at most
    /// `depth` blocks are ever in flight or held.
    fn schedule(&self, first: u64, size: u64) {
        let bs = self.pool.block_size;
        let window = first..first.saturating_add(self.pool.depth as u64);
        self.pending.retain_sync(|index, task| {
            if window.contains(index) {
                return true;
            }
            task.abort();
            false
        });
        for index in window {
            if index.saturating_mul(bs) >= size {
                break;
            }
            if let scc::hash_map::Entry::Vacant(vac) = self.pending.entry_sync(index) {
                let reader = Arc::clone(&self.reader);
                let workers = Arc::clone(&self.pool.workers);
                let block_len = usize::try_from(bs).unwrap_or(usize::MAX);
                vac.insert_entry(tokio::spawn(async move {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        return Err(ReadError::Destroyed("block pool"));
                    };
                    Ok(reader.read_at(index * bs, block_len).await?.data)
                }));
            }
        }
    }

    /// Number of background fetches not yet consumed.
    #[must_use]
    pub fn pending_blocks(&self) -> usize {
        self.pending.len()
    }

    /// Abort outstanding read-ahead. The wrapped reader is destroyed by its
    /// owner.
    pub fn destroy(&self) {
        self.pending.retain_sync(|_, task| {
            task.abort();
            false
        });
        *self.current.lock() = None;
    }
}
