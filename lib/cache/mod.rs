//! Local caching of remote object content.

/// Whole-object cache keyed by bucket and object name.
pub mod content;

pub use content::{CacheError, CacheKey, CachedFile, ContentCache, InvalidRootPathError, RecoveryReport};
