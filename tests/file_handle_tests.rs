#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use objfs::fs::{FileInode, MinObject, OpenFlags};
use objfs::read::{FileHandle, ReadError, ReadOptions, ReaderBinding};
use tokio::task::JoinSet;

use common::MockStore;

const BUCKET: &str = "bucket";

fn setup(contents: &[u8]) -> (MockStore, Arc<FileInode<MockStore>>) {
    setup_with(contents, false)
}

fn setup_with(
    contents: &[u8],
    cache_file_for_range_read: bool,
) -> (MockStore, Arc<FileInode<MockStore>>) {
    let store = MockStore::new();
    let object = store.put("docs/readme.txt", contents);
    let inode = Arc::new(FileInode::new(
        2,
        BUCKET,
        object,
        store.clone(),
        cache_file_for_range_read,
    ));
    (store, inode)
}

fn open(inode: &Arc<FileInode<MockStore>>) -> FileHandle<MockStore> {
    FileHandle::open(Arc::clone(inode), OpenFlags::RDONLY, ReadOptions::default())
}

#[tokio::test]
async fn reader_is_bound_lazily_and_reused() {
    let (store, inode) = setup(b"hello world");
    let handle = open(&inode);
    assert_eq!(store.readers_created(), 0);
    assert!(handle.binding().await.is_none());

    let resp = handle.read(0, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"hello");
    assert!(!resp.eof);
    assert_eq!(store.readers_created(), 1);
    let first = handle.binding().await.unwrap();
    assert!(matches!(*first, ReaderBinding::Random(_)));

    let resp = handle.read(6, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"world");
    let second = handle.binding().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(store.readers_created(), 1);
}

#[tokio::test]
async fn end_of_object_is_eof_not_an_error() {
    let (_, inode) = setup(b"hello world");
    let handle = open(&inode);

    let resp = handle.read(6, 100).await.unwrap();
    assert_eq!(&resp.data[..], b"world");
    assert!(resp.eof);

    let resp = handle.read(100, 10).await.unwrap();
    assert!(resp.data.is_empty());
    assert!(resp.eof);
}

#[tokio::test]
async fn short_store_reads_are_stitched_together() {
    let (store, inode) = setup(b"hello world");
    store.set_max_chunk(3);
    let handle = open(&inode);

    let resp = handle.read(0, 11).await.unwrap();
    assert_eq!(&resp.data[..], b"hello world");
    assert!(!resp.eof);
    assert_eq!(store.reads(), 4);
}

#[tokio::test]
async fn generation_change_rebuilds_reader() {
    let (store, inode) = setup(b"hello world");
    let handle = open(&inode);
    handle.read(0, 5).await.unwrap();
    let old = handle.binding().await.unwrap();
    assert_eq!(old.generation().object, 1);

    inode.write(0, b"HELLO").await.unwrap();
    assert!(inode.sync().await.unwrap());

    let resp = handle.read(0, 11).await.unwrap();
    assert_eq!(&resp.data[..], b"HELLO world");
    let new = handle.binding().await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new), "stale reader must not be reused");
    assert_eq!(new.generation().object, 2);
    assert!(old.reader().is_destroyed());
    assert!(!new.reader().is_destroyed());
    assert_eq!(store.readers_created(), 3, "initial, write materialization, rebind");
}

#[tokio::test]
async fn old_binding_keeps_serving_its_generation() {
    let (_, inode) = setup(b"hello world");
    let handle = open(&inode);
    handle.read(0, 1).await.unwrap();
    let old = handle.binding().await.unwrap();

    inode.write(0, b"HELLO").await.unwrap();
    inode.sync().await.unwrap();

    // Not yet torn down: nothing has read through the handle since.
    let resp = old.read_at(0, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"hello");

    let resp = handle.read(0, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"HELLO");
    assert!(matches!(
        old.read_at(0, 5).await,
        Err(ReadError::Destroyed(_))
    ));
}

#[tokio::test]
async fn metadata_change_rebuilds_reader() {
    let (store, inode) = setup(b"hello world");
    let handle = open(&inode);
    handle.read(0, 5).await.unwrap();
    let old = handle.binding().await.unwrap();

    inode
        .refresh_source(store.touch_metadata("docs/readme.txt"))
        .await;

    handle.read(0, 5).await.unwrap();
    let new = handle.binding().await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.generation().object, old.generation().object);
    assert_eq!(new.generation().metadata, old.generation().metadata + 1);
    assert!(old.reader().is_destroyed());
}

#[tokio::test]
async fn size_refresh_keeps_reader() {
    let (_, inode) = setup(b"hello world");
    let handle = open(&inode);
    handle.read(0, 5).await.unwrap();
    let old = handle.binding().await.unwrap();

    inode
        .refresh_source(MinObject {
            name: "docs/readme.txt".to_owned(),
            size: 5,
            generation: 1,
            meta_generation: 1,
        })
        .await;

    let resp = handle.read(0, 100).await.unwrap();
    assert_eq!(&resp.data[..], b"hello");
    assert!(resp.eof);
    let new = handle.binding().await.unwrap();
    assert!(Arc::ptr_eq(&old, &new));
    assert_eq!(new.reader().size(), 5);
}

#[tokio::test]
async fn dirty_inode_is_read_locally_and_reader_destroyed_once() {
    let (store, inode) = setup(b"hello world");
    let handle = open(&inode);
    handle.read(0, 5).await.unwrap();
    let old = handle.binding().await.unwrap();
    assert_eq!(store.closes(), 0);

    inode.write(0, b"J").await.unwrap();
    // The write pulled the object through a short-lived reader of its own.
    assert_eq!(store.closes(), 1);

    let resp = handle.read(0, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"Jello");
    assert!(handle.binding().await.is_none());
    assert!(old.reader().is_destroyed());
    assert_eq!(store.closes(), 2);

    let resp = handle.read(0, 100).await.unwrap();
    assert_eq!(&resp.data[..], b"Jello world");
    assert!(resp.eof);
    old.destroy();
    assert_eq!(store.closes(), 2, "reader must be closed exactly once");
}

#[tokio::test]
async fn range_read_cache_serves_from_the_inode() {
    let (store, inode) = setup_with(b"hello world", true);
    let handle = open(&inode);

    let resp = handle.read(6, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"world");
    assert!(handle.binding().await.is_none());
    assert_eq!(store.readers_created(), 1);

    handle.read(0, 5).await.unwrap();
    assert_eq!(store.readers_created(), 1, "content is materialized once");
    assert!(!inode.lock().await.source_generation_is_authoritative());
}

#[tokio::test]
async fn sync_skips_content_that_was_only_read() {
    let (store, inode) = setup_with(b"hello world", true);
    let handle = open(&inode);
    handle.read(0, 5).await.unwrap();
    assert!(!inode.lock().await.is_dirty());

    assert!(!inode.sync().await.unwrap(), "nothing was written");
    assert_eq!(inode.lock().await.source().generation, 1);
    let latest = store.state.latest.lock().unwrap()["docs/readme.txt"].generation;
    assert_eq!(latest, 1, "no new remote generation");

    let resp = handle.read(6, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"world");

    inode.write(0, b"J").await.unwrap();
    assert!(inode.lock().await.is_dirty());
    assert!(inode.sync().await.unwrap());
    let state = inode.lock().await;
    assert_eq!(state.source().generation, 2);
    assert!(!state.is_dirty());
}

#[tokio::test]
async fn transfer_error_keeps_binding() {
    let (store, inode) = setup(b"hello world");
    let handle = open(&inode);
    handle.read(0, 5).await.unwrap();
    let bound = handle.binding().await.unwrap();

    store.fail_reads(true);
    let err = handle.read(0, 5).await.unwrap_err();
    assert!(matches!(err, ReadError::Transfer { .. }), "{err:?}");
    assert_eq!(i32::from(err), libc::EIO);

    store.fail_reads(false);
    let resp = handle.read(0, 5).await.unwrap();
    assert_eq!(&resp.data[..], b"hello");
    assert!(Arc::ptr_eq(&bound, &handle.binding().await.unwrap()));
    assert!(!bound.reader().is_destroyed());
}

#[tokio::test]
async fn destroy_is_idempotent_and_deregisters_once() {
    let (store, inode) = setup(b"hello world");
    let reader = open(&inode);
    let writer = FileHandle::open(Arc::clone(&inode), OpenFlags::RDWR, ReadOptions::default());
    assert_eq!(inode.handle_counts().readers, 1);
    assert_eq!(inode.handle_counts().writers, 1);

    // Never read: nothing to tear down but the registration.
    writer.destroy().await;
    writer.destroy().await;
    assert_eq!(inode.handle_counts().writers, 0);

    reader.read(0, 1).await.unwrap();
    reader.destroy().await;
    reader.destroy().await;
    assert_eq!(inode.handle_counts().readers, 0);
    assert_eq!(store.closes(), 1);
    assert!(reader.binding().await.is_none());

    let err = reader.read(0, 1).await.unwrap_err();
    assert!(matches!(err, ReadError::Destroyed(_)));
    assert_eq!(i32::from(err), libc::EBADF);
}

#[tokio::test]
async fn invariants_hold_across_rebinds() {
    let (_, inode) = setup(b"hello world");
    let handle = open(&inode);
    handle.check_invariants().await.unwrap();

    handle.read(0, 5).await.unwrap();
    handle.check_invariants().await.unwrap();

    inode.write(0, b"x").await.unwrap();
    inode.sync().await.unwrap();
    handle.read(0, 5).await.unwrap();
    handle.check_invariants().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_share_one_reader() {
    let contents: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    let (store, inode) = setup(&contents);
    let handle = Arc::new(open(&inode));

    let mut set = JoinSet::new();
    for i in 0..32u64 {
        let handle = Arc::clone(&handle);
        set.spawn(async move {
            let offset = i * 1000;
            let resp = handle.read(offset, 1000).await.unwrap();
            (offset, resp.data)
        });
    }
    while let Some(res) = set.join_next().await {
        let (offset, data) = res.unwrap();
        let start = usize::try_from(offset).unwrap();
        assert_eq!(&data[..], &contents[start..start + 1000]);
    }
    assert_eq!(store.readers_created(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handles_on_one_inode_rebind_independently() {
    let (store, inode) = setup(b"hello world");
    let a = open(&inode);
    let b = open(&inode);
    a.read(0, 5).await.unwrap();
    b.read(0, 5).await.unwrap();
    assert_eq!(store.readers_created(), 2);

    inode.write(0, b"HELLO").await.unwrap();
    inode.sync().await.unwrap();

    let (ra, rb) = tokio::join!(a.read(0, 5), b.read(0, 5));
    assert_eq!(&ra.unwrap().data[..], b"HELLO");
    assert_eq!(&rb.unwrap().data[..], b"HELLO");
    assert_eq!(a.binding().await.unwrap().generation().object, 2);
    assert_eq!(b.binding().await.unwrap().generation().object, 2);
}
