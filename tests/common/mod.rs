#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use objfs::fs::{DirEntry, DirEntryPlus, EntryAttrs, EntryType, MinObject};
use objfs::store::{EntryCore, ListingSource, ObjectReader, ObjectStore};

pub fn file(name: &str) -> DirEntry {
    DirEntry::new(name, EntryType::File)
}

pub fn dir(name: &str) -> DirEntry {
    DirEntry::new(name, EntryType::Directory)
}

pub fn file_plus(name: &str, size: u64) -> DirEntryPlus {
    DirEntryPlus::new(
        name,
        EntryType::File,
        EntryAttrs {
            size,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            child: 0,
        },
    )
}

pub fn dir_plus(name: &str) -> DirEntryPlus {
    DirEntryPlus::new(
        name,
        EntryType::Directory,
        EntryAttrs {
            size: 0,
            mode: libc::S_IFDIR | 0o755,
            nlink: 2,
            child: 0,
        },
    )
}

/// Key a list of entries by name, the way callers supply local entries.
pub fn local<T: Clone>(entries: &[T], name: impl Fn(&T) -> &str) -> BTreeMap<String, T> {
    entries
        .iter()
        .map(|e| (name(e).to_owned(), e.clone()))
        .collect()
}

pub fn local_files(names: &[&str]) -> BTreeMap<String, DirEntry> {
    local(&names.iter().map(|n| file(n)).collect::<Vec<_>>(), |e| &e.name)
}

/// Parse a buffer of `fuse_dirent` records back into `(offset, name)` pairs.
pub fn decode_dirents(buf: &[u8]) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    let mut at = 0;
    while at + 24 <= buf.len() {
        let off = u64::from_ne_bytes(buf[at + 8..at + 16].try_into().unwrap());
        let namelen = u32::from_ne_bytes(buf[at + 16..at + 20].try_into().unwrap()) as usize;
        let name = String::from_utf8(buf[at + 24..at + 24 + namelen].to_vec()).unwrap();
        out.push((off, name));
        at += (24 + namelen + 7) & !7;
    }
    out
}

/// Shared state behind [`MockStore`] and its readers.
#[derive(Debug, Default)]
pub struct MockStoreState {
    /// Object name -> every generation's content, oldest first.
    pub generations: Mutex<HashMap<String, Vec<(i64, Bytes)>>>,
    /// Object name -> latest record.
    pub latest: Mutex<HashMap<String, MinObject>>,
    pub readers_created: AtomicUsize,
    pub closes: AtomicUsize,
    pub reads: AtomicUsize,
    /// When set, every reader read fails with a non-EOF error.
    pub fail_reads: AtomicBool,
    /// Largest chunk a single reader read returns. Zero means unlimited.
    pub max_chunk: AtomicUsize,
}

/// An in-memory object store that keeps every generation it has seen.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    pub state: Arc<MockStoreState>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `contents` as a new generation of `name`.
    pub fn put(&self, name: &str, contents: &[u8]) -> MinObject {
        let mut generations = self.state.generations.lock().unwrap();
        let versions = generations.entry(name.to_owned()).or_default();
        let generation = versions.last().map_or(1, |(g, _)| g + 1);
        versions.push((generation, Bytes::copy_from_slice(contents)));
        let object = MinObject {
            name: name.to_owned(),
            size: contents.len() as u64,
            generation,
            meta_generation: 1,
        };
        self.state
            .latest
            .lock()
            .unwrap()
            .insert(name.to_owned(), object.clone());
        object
    }

    /// Bump the metadata generation of `name` without touching its content.
    pub fn touch_metadata(&self, name: &str) -> MinObject {
        let mut latest = self.state.latest.lock().unwrap();
        let object = latest.get_mut(name).unwrap();
        object.meta_generation += 1;
        object.clone()
    }

    pub fn readers_created(&self) -> usize {
        self.state.readers_created.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_max_chunk(&self, n: usize) {
        self.state.max_chunk.store(n, Ordering::SeqCst);
    }
}

/// Reader over one generation's content, captured at creation.
#[derive(Debug)]
pub struct MockReader {
    pub content: Bytes,
    pub state: Arc<MockStoreState>,
}

impl ObjectReader for MockReader {
    async fn read(&self, offset: u64, len: usize) -> Result<Bytes, std::io::Error> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected read failure",
            ));
        }
        let start = usize::try_from(offset).unwrap();
        if start >= self.content.len() {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        let mut end = (start + len).min(self.content.len());
        let chunk = self.state.max_chunk.load(Ordering::SeqCst);
        if chunk > 0 {
            end = end.min(start + chunk);
        }
        Ok(self.content.slice(start..end))
    }

    fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl ObjectStore for MockStore {
    type Reader = MockReader;

    fn new_reader(&self, _bucket: &str, object: &MinObject) -> MockReader {
        self.state.readers_created.fetch_add(1, Ordering::SeqCst);
        let content = self
            .state
            .generations
            .lock()
            .unwrap()
            .get(&object.name)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|(g, _)| *g == object.generation)
                    .map(|(_, c)| c.clone())
            })
            .unwrap_or_default();
        MockReader {
            content,
            state: Arc::clone(&self.state),
        }
    }

    async fn create_object(
        &self,
        _bucket: &str,
        name: &str,
        contents: Bytes,
    ) -> Result<MinObject, std::io::Error> {
        Ok(self.put(name, &contents))
    }
}

/// A paged directory listing.
///
/// Page `i` is served for token `""` (i = 0) or `i.to_string()`; the returned
/// token is empty after the last page.
#[derive(Debug, Default)]
pub struct MockListing {
    pub pages: Vec<Vec<DirEntry>>,
    pub core_pages: Vec<BTreeMap<String, EntryCore>>,
    /// Fail the fetch of this page index.
    pub fail_page: Option<usize>,
    pub fetches: AtomicUsize,
}

impl MockListing {
    pub fn with_pages(pages: Vec<Vec<DirEntry>>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn page_index(token: &str) -> usize {
        if token.is_empty() {
            0
        } else {
            token.parse().unwrap()
        }
    }

    fn next_token(index: usize, count: usize) -> String {
        if index + 1 < count {
            (index + 1).to_string()
        } else {
            String::new()
        }
    }
}

impl ListingSource for MockListing {
    async fn read_entries(&self, token: &str) -> Result<(Vec<DirEntry>, String), std::io::Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let index = Self::page_index(token);
        if self.fail_page == Some(index) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected listing failure",
            ));
        }
        let page = self.pages.get(index).cloned().unwrap_or_default();
        Ok((page, Self::next_token(index, self.pages.len())))
    }

    async fn read_entry_cores(
        &self,
        token: &str,
    ) -> Result<(BTreeMap<String, EntryCore>, String), std::io::Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let index = Self::page_index(token);
        if self.fail_page == Some(index) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected listing failure",
            ));
        }
        let page = self.core_pages.get(index).cloned().unwrap_or_default();
        Ok((page, Self::next_token(index, self.core_pages.len())))
    }
}
