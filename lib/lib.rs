//! objfs: the read-path consistency core of an object-store filesystem.

/// Local caching of object content.
pub mod cache;
/// Directory listings, file inodes and the types they share.
pub mod fs;
pub mod io;
/// Reader bindings for open files.
pub mod read;
pub mod store;
