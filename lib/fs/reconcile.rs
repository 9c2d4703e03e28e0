//! Merge remote and local listings into one POSIX-legal sequence.
//!
//! The same pipeline serves plain and attribute-bearing records through the
//! [`ListingRecord`] capability trait:
//!
//! 1. local entries are appended to the remote batch,
//! 2. the batch is stably sorted by name (byte-wise), directories first on ties,
//! 3. adjacent equal names are repaired or rejected,
//! 4. offsets are assigned 1..=n,
//! 5. every entry gets [`PLACEHOLDER_INODE_ID`].

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::error;

use crate::fs::{
    CONFLICT_SUFFIX, DirEntry, DirEntryPlus, EntryType, InodeId, PLACEHOLDER_INODE_ID,
    strip_conflict_suffix,
};

/// The record operations the reconciler needs.
pub trait ListingRecord {
    /// Current name.
    fn name(&self) -> &str;
    /// Replace the name. Only used to append [`CONFLICT_SUFFIX`].
    fn set_name(&mut self, name: String);
    /// Entry type.
    fn kind(&self) -> EntryType;
    /// Assign the stable offset.
    fn set_offset(&mut self, offset: u64);
    /// Assign the reported inode identifier.
    fn set_inode(&mut self, inode: InodeId);
}

impl ListingRecord for DirEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn kind(&self) -> EntryType {
        self.kind
    }

    fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    fn set_inode(&mut self, inode: InodeId) {
        self.inode = inode;
    }
}

impl ListingRecord for DirEntryPlus {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn set_name(&mut self, name: String) {
        self.entry.name = name;
    }

    fn kind(&self) -> EntryType {
        self.entry.kind
    }

    fn set_offset(&mut self, offset: u64) {
        self.entry.offset = offset;
    }

    fn set_inode(&mut self, inode: InodeId) {
        self.entry.inode = inode;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Two entries share a name and type and no upload race explains it.
    #[error("ambiguous name collision: {0:?}")]
    AmbiguousCollision(String),

    /// The resolver saw entries out of order. The sort step makes this
    /// unreachable; seeing it means the pipeline itself is broken.
    #[error("internal invariant violated: {prev:?} listed before {next:?}")]
    Unsorted {
        /// The earlier name.
        prev: String,
        /// The later, smaller name.
        next: String,
    },
}

impl From<ReconcileError> for i32 {
    fn from(_: ReconcileError) -> Self {
        libc::EIO
    }
}

/// Merge `remote` with the values of `local`, then sort, resolve conflicts,
/// assign offsets and stamp placeholder inodes.
///
/// On error nothing is returned; callers keep whatever they had before.
pub fn reconcile<T>(
    mut remote: Vec<T>,
    local: &BTreeMap<String, T>,
) -> Result<Vec<T>, ReconcileError>
where
    T: ListingRecord + Clone,
{
    remote.extend(local.values().cloned());
    remote.sort_by(|a, b| {
        a.name()
            .as_bytes()
            .cmp(b.name().as_bytes())
            .then_with(|| a.kind().cmp(&b.kind()))
    });

    let mut resolved = resolve_conflicts(remote, |name| local.contains_key(name))?;
    for (i, entry) in resolved.iter_mut().enumerate() {
        entry.set_offset(i as u64 + 1);
        entry.set_inode(PLACEHOLDER_INODE_ID);
    }
    Ok(resolved)
}

/// Resolve adjacent equal names in an already sorted sequence.
///
/// `is_local` reports whether a name is present among the caller's local
/// entries. The comparison uses names as they were before suffixing, so a
/// file pushed aside by a directory still pairs with its local twin.
pub fn resolve_conflicts<T, F>(sorted: Vec<T>, is_local: F) -> Result<Vec<T>, ReconcileError>
where
    T: ListingRecord,
    F: Fn(&str) -> bool,
{
    let mut out: Vec<T> = Vec::with_capacity(sorted.len());
    for mut entry in sorted {
        let Some(prev) = out.last_mut() else {
            out.push(entry);
            continue;
        };

        let (prev_base, prev_renamed) = strip_conflict_suffix(prev.name());
        match prev_base.as_bytes().cmp(entry.name().as_bytes()) {
            std::cmp::Ordering::Less => {
                out.push(entry);
                continue;
            }
            std::cmp::Ordering::Greater => {
                let err = ReconcileError::Unsorted {
                    prev: prev.name().to_owned(),
                    next: entry.name().to_owned(),
                };
                error!(error = %err, "listing reached the conflict resolver unsorted");
                return Err(err);
            }
            std::cmp::Ordering::Equal => {}
        }

        match (prev.kind().is_dir(), entry.kind().is_dir()) {
            (true, false) => {
                let renamed = format!("{}{CONFLICT_SUFFIX}", entry.name());
                entry.set_name(renamed);
                out.push(entry);
            }
            (false, true) => {
                // Directories sort first on ties, so this only happens when
                // the earlier file was already renamed away from another
                // directory of the same name.
                if prev_renamed {
                    return Err(ReconcileError::AmbiguousCollision(entry.name().to_owned()));
                }
                let renamed = format!("{}{CONFLICT_SUFFIX}", prev.name());
                prev.set_name(renamed);
                out.push(entry);
            }
            (false, false) if prev.kind() == entry.kind() && is_local(entry.name()) => {
                // Upload race: the object landed remotely while the local copy
                // is still open. The later entry is the local one; keep it and
                // carry over the earlier name (suffixed or not).
                let name = prev.name().to_owned();
                entry.set_name(name);
                *prev = entry;
            }
            _ => {
                return Err(ReconcileError::AmbiguousCollision(entry.name().to_owned()));
            }
        }
    }
    Ok(out)
}
