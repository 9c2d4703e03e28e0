//! Whole-object content cache.
//!
//! Each cached object is a data file `<n>.data` plus a TOML sidecar
//! `<n>.meta.toml` recording which bucket, object and generation pair the
//! bytes belong to. Sidecars are written after their data file, so a crash
//! never leaves a sidecar describing partial data, and they are what
//! [`ContentCache::recover_cache`] rebuilds the index from after a restart.
//!
//! The cache does no locking of its own. Lookups borrow `&self`; everything
//! that changes the index borrows `&mut self`, so sharing it between tasks
//! requires an external lock.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::io;

#[derive(Debug, Error)]
pub enum InvalidRootPathError {
    #[error("Root path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Root path appears to contain data stemming from sources different to this app: {0}")]
    RootPathUnsafeCache(PathBuf),

    #[error("IO error while accessing root path: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    InvalidRoot(#[from] InvalidRootPathError),

    #[error("IO error in content cache: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode sidecar: {0}")]
    Sidecar(#[from] toml::ser::Error),
}

/// Identifies a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub bucket: String,
    pub object: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(bucket: &str, object: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            object: object.to_owned(),
        }
    }
}

/// On-disk record describing one data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Sidecar {
    bucket: String,
    object: String,
    generation: i64,
    meta_generation: i64,
    data_file: String,
    size: u64,
}

/// A cached object's bytes on local disk, stamped with the generation pair
/// they were downloaded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    path: PathBuf,
    generation: i64,
    meta_generation: i64,
    size: u64,
}

impl CachedFile {
    /// Whether this entry holds exactly `generation` / `meta_generation`.
    #[must_use]
    pub fn validate_generation(&self, generation: i64, meta_generation: i64) -> bool {
        self.generation == generation && self.meta_generation == meta_generation
    }

    #[must_use]
    pub fn generation(&self) -> i64 {
        self.generation
    }

    #[must_use]
    pub fn meta_generation(&self) -> i64 {
        self.meta_generation
    }

    /// Size of the cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `len` bytes at `offset`. Short at the end of the data.
    pub async fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        if offset >= self.size {
            return Ok(Bytes::new());
        }
        io::read_range(&self.path, offset, len).await
    }
}

struct Slot {
    id: u64,
    file: CachedFile,
}

/// What [`ContentCache::recover_cache`] found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries rehydrated into the index.
    pub recovered: usize,
    /// Sidecars that could not be used.
    pub skipped: usize,
    /// Total size of the recovered entries.
    pub bytes: u64,
    /// Entries deleted from disk: older duplicate copies and data files left
    /// without a sidecar.
    pub discarded: usize,
}

/// Index of cached objects under one root directory.
///
/// Sharing a cache between tasks without a lock does not compile:
///
/// ```compile_fail
/// # async fn evict_from_two_tasks(cache: objfs::cache::ContentCache) {
/// let cache = std::sync::Arc::new(cache);
/// let other = std::sync::Arc::clone(&cache);
/// tokio::spawn(async move { other.remove("bucket", "object").await });
/// # }
/// ```
pub struct ContentCache {
    root: PathBuf,
    index: FxHashMap<CacheKey, Slot>,
    next_id: u64,
}

impl ContentCache {
    // Changing this makes every existing cache directory look foreign.
    const MARKER_FILE: &'static str = ".objfs_cache";
    const DATA_EXT: &'static str = "data";
    const SIDECAR_SUFFIX: &'static str = ".meta.toml";

    /// Open the cache rooted at `root`, creating the directory if needed.
    ///
    /// An existing directory must be empty or carry this cache's marker file.
    /// Its contents are kept; call [`recover_cache`](Self::recover_cache) to
    /// index them.
    pub async fn open(root: &Path) -> Result<Self, InvalidRootPathError> {
        let mut pbuf = match tokio::fs::canonicalize(root).await {
            Ok(mut p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(InvalidRootPathError::NotADirectory(p));
                }

                let mut entries = tokio::fs::read_dir(&p).await?;
                let is_empty = entries.next_entry().await?.is_none();

                p.push(Self::MARKER_FILE);
                let marker_exists = tokio::fs::try_exists(&p).await?;
                p.pop();

                if !(is_empty || marker_exists) {
                    return Err(InvalidRootPathError::RootPathUnsafeCache(p));
                }
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(root).await?;
                tokio::fs::canonicalize(root).await?
            }
            Err(e) => return Err(e.into()),
        };

        pbuf.push(Self::MARKER_FILE);
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&pbuf)
            .await?;
        pbuf.pop();

        Ok(Self {
            root: pbuf,
            index: FxHashMap::default(),
            next_id: 0,
        })
    }

    /// The canonical cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of indexed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Combined size of every indexed entry.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.index.values().map(|slot| slot.file.size).sum()
    }

    /// Look up the entry for `bucket` / `object`, whatever its generation.
    #[must_use]
    pub fn get(&self, bucket: &str, object: &str) -> Option<&CachedFile> {
        self.index
            .get(&CacheKey::new(bucket, object))
            .map(|slot| &slot.file)
    }

    /// Install `source` as the cached content of `bucket` / `object`.
    ///
    /// Any previous entry for the key is destroyed first.
    pub async fn add_or_replace(
        &mut self,
        bucket: &str,
        object: &str,
        generation: i64,
        meta_generation: i64,
        source: &[u8],
    ) -> Result<&CachedFile, CacheError> {
        self.remove(bucket, object).await;

        let (id, data_path) = self.create_data_file(source).await?;
        let data_file = Self::data_file_name(id);
        let sidecar = Sidecar {
            bucket: bucket.to_owned(),
            object: object.to_owned(),
            generation,
            meta_generation,
            data_file,
            size: source.len() as u64,
        };
        let encoded = toml::to_string(&sidecar)?;
        if let Err(e) = io::write_atomic(&self.sidecar_path(id), encoded.as_bytes()).await {
            Self::remove_logged(&data_path).await;
            return Err(e.into());
        }

        debug!(bucket, object, generation, meta_generation, id, "cached object");
        let slot = self
            .index
            .entry(CacheKey::new(bucket, object))
            .insert_entry(Slot {
                id,
                file: CachedFile {
                    path: data_path,
                    generation,
                    meta_generation,
                    size: sidecar.size,
                },
            })
            .into_mut();
        Ok(&slot.file)
    }

    /// Destroy and forget the entry for `bucket` / `object`, if any.
    pub async fn remove(&mut self, bucket: &str, object: &str) {
        let Some(slot) = self.index.remove(&CacheKey::new(bucket, object)) else {
            return;
        };
        self.remove_files(slot.id).await;
        debug!(bucket, object, id = slot.id, "evicted cached object");
    }

    /// Delete the sidecar and data file for `id`.
    async fn remove_files(&self, id: u64) {
        // Sidecar first: a data file without a sidecar is never recovered.
        for path in [self.sidecar_path(id), self.root.join(Self::data_file_name(id))] {
            Self::remove_logged(&path).await;
        }
    }

    async fn remove_logged(path: &Path) {
        if let Err(e) = io::remove_if_exists(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }

    /// Rebuild the index from the sidecars under the cache root.
    ///
    /// A sidecar that cannot be read, does not parse, or points at a missing
    /// or mismatched data file is skipped with a warning. When two sidecars
    /// name the same object, the higher `(generation, meta_generation)` wins
    /// (then the higher id) and the other copy is deleted. Data files with no
    /// sidecar are deleted.
    #[instrument(name = "ContentCache::recover_cache", skip(self), fields(root = %self.root.display()))]
    pub async fn recover_cache(&mut self) -> Result<RecoveryReport, CacheError> {
        let mut report = RecoveryReport::default();
        let mut data_ids = Vec::new();
        let mut sidecar_ids = FxHashSet::default();
        // List first: recovery deletes files as it goes.
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        for name in &names {
            if let Some(id) = Self::parse_data_name(name) {
                self.next_id = self.next_id.max(id + 1);
                data_ids.push(id);
                continue;
            }
            let Some(id) = Self::parse_sidecar_name(name) else {
                continue;
            };
            self.next_id = self.next_id.max(id + 1);
            sidecar_ids.insert(id);

            let path = self.root.join(name);
            match self.load_sidecar(id, &path).await {
                Ok((key, file)) => {
                    if let Some(existing) = self.index.get(&key)
                        && Self::recency(existing.id, &existing.file) > Self::recency(id, &file)
                    {
                        warn!(id, object = %key.object, "duplicate cache entry, discarding older copy");
                        self.remove_files(id).await;
                        report.skipped += 1;
                        report.discarded += 1;
                        continue;
                    }
                    report.recovered += 1;
                    report.bytes += file.size;
                    if let Some(old) = self.index.insert(key, Slot { id, file }) {
                        warn!(id = old.id, "duplicate cache entry, replaced by newer copy");
                        self.remove_files(old.id).await;
                        report.recovered -= 1;
                        report.bytes -= old.file.size;
                        report.skipped += 1;
                        report.discarded += 1;
                    }
                }
                Err(reason) => {
                    warn!(id, path = %path.display(), %reason, "skipping cache entry");
                    report.skipped += 1;
                }
            }
        }

        for id in data_ids {
            if sidecar_ids.contains(&id) {
                continue;
            }
            debug!(id, "discarding data file without a sidecar");
            Self::remove_logged(&self.root.join(Self::data_file_name(id))).await;
            report.discarded += 1;
        }

        debug!(?report, "recovered content cache");
        Ok(report)
    }

    /// Ordering used to pick between duplicate copies of one object.
    fn recency(id: u64, file: &CachedFile) -> (i64, i64, u64) {
        (file.generation, file.meta_generation, id)
    }

    async fn load_sidecar(&self, id: u64, path: &Path) -> Result<(CacheKey, CachedFile), String> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("unreadable sidecar: {e}"))?;
        let sidecar: Sidecar =
            toml::from_str(&text).map_err(|e| format!("malformed sidecar: {e}"))?;
        if sidecar.data_file != Self::data_file_name(id) {
            return Err(format!("sidecar names foreign data file {:?}", sidecar.data_file));
        }
        let data_path = self.root.join(&sidecar.data_file);
        let meta = tokio::fs::metadata(&data_path)
            .await
            .map_err(|e| format!("missing data file: {e}"))?;
        if meta.len() != sidecar.size {
            return Err(format!(
                "data file is {} bytes, sidecar says {}",
                meta.len(),
                sidecar.size
            ));
        }
        Ok((
            CacheKey {
                bucket: sidecar.bucket,
                object: sidecar.object,
            },
            CachedFile {
                path: data_path,
                generation: sidecar.generation,
                meta_generation: sidecar.meta_generation,
                size: sidecar.size,
            },
        ))
    }

    /// Write `source` to a fresh data file, skipping ids already on disk.
    async fn create_data_file(&mut self, source: &[u8]) -> Result<(u64, PathBuf), CacheError> {
        loop {
            let id = self.next_id;
            self.next_id += 1;
            let path = self.root.join(Self::data_file_name(id));
            match io::write_new(&path, source).await {
                Ok(()) => return Ok((id, path)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    Self::remove_logged(&path).await;
                    return Err(e.into());
                }
            }
        }
    }

    fn data_file_name(id: u64) -> String {
        format!("{id}.{}", Self::DATA_EXT)
    }

    fn sidecar_path(&self, id: u64) -> PathBuf {
        self.root.join(format!("{id}{}", Self::SIDECAR_SUFFIX))
    }

    fn parse_sidecar_name(name: &str) -> Option<u64> {
        Self::parse_id(name, Self::SIDECAR_SUFFIX)
    }

    fn parse_data_name(name: &str) -> Option<u64> {
        Self::parse_id(name.strip_suffix(Self::DATA_EXT)?, ".")
    }

    fn parse_id(name: &str, suffix: &str) -> Option<u64> {
        let digits = name.strip_suffix(suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}
