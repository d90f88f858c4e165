//! Checkout engine
//!
//! A checkout rewrites the working tree from one snapshot to another by
//! walking (old-tree, new-tree, live-inode) triples concurrently and
//! producing either mutations or conflict records. Conflicts are never
//! errors; per-entry failures become `ERROR` conflicts and the walk
//! continues for siblings.

mod action;

use crate::inode::InodeContext;
use crate::store::{Blob, FetchStats, Hash, Sha1Digest, Tree};
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How conflicting entries are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutMode {
    /// Report conflicts, leave conflicting entries alone
    Normal,
    /// Walk and report, but commit no mutations
    DryRun,
    /// Report conflicts and overwrite anyway
    Force,
}

impl CheckoutMode {
    pub fn apply_mutations(&self) -> bool {
        !matches!(self, CheckoutMode::DryRun)
    }

    pub fn is_force(&self) -> bool {
        matches!(self, CheckoutMode::Force)
    }
}

/// Why a path was not (or, under FORCE, would not have been) updated cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    /// A locally-added entry is in the way of the target
    UntrackedAdded,
    /// Local content differs from the source snapshot
    Modified,
    /// The target removes or replaces a file that is already gone locally
    MissingRemoved,
    /// A directory slated for replacement still has entries
    DirectoryNotEmpty,
    /// An uncategorized per-entry failure
    Error,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictType::UntrackedAdded => "UNTRACKED_ADDED",
            ConflictType::Modified => "MODIFIED",
            ConflictType::MissingRemoved => "MISSING_REMOVED",
            ConflictType::DirectoryNotEmpty => "DIRECTORY_NOT_EMPTY",
            ConflictType::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One per-path conflict record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictType,
    /// Present for `Error` conflicts
    pub message: Option<String>,
}

impl Conflict {
    pub fn new(path: impl Into<String>, kind: ConflictType) -> Self {
        Conflict {
            path: path.into(),
            kind,
            message: None,
        }
    }
}

/// The outcome of one checkout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResult {
    pub conflicts: Vec<Conflict>,
    /// Paths the checkout mutated, for the journal
    pub changed_paths: Vec<String>,
}

/// Per-checkout shared state: target, mode, conflicts, fetch counters
pub struct CheckoutContext {
    inode_ctx: Arc<InodeContext>,
    mode: CheckoutMode,
    conflicts: Mutex<Vec<Conflict>>,
    changed_paths: Mutex<Vec<String>>,
    pub stats: FetchStats,
}

impl CheckoutContext {
    pub fn new(inode_ctx: Arc<InodeContext>, mode: CheckoutMode) -> Arc<Self> {
        Arc::new(CheckoutContext {
            inode_ctx,
            mode,
            conflicts: Mutex::new(Vec::new()),
            changed_paths: Mutex::new(Vec::new()),
            stats: FetchStats::new(),
        })
    }

    pub fn mode(&self) -> CheckoutMode {
        self.mode
    }

    pub fn inode_ctx(&self) -> &Arc<InodeContext> {
        &self.inode_ctx
    }

    pub fn add_conflict(&self, path: &str, kind: ConflictType) {
        self.conflicts.lock().push(Conflict::new(path, kind));
    }

    pub fn add_error(&self, path: &str, error: &crate::error::Error) {
        let mut c = Conflict::new(path, ConflictType::Error);
        c.message = Some(error.to_string());
        self.conflicts.lock().push(c);
    }

    pub fn record_changed(&self, path: &str) {
        self.changed_paths.lock().push(path.to_string());
    }

    /// Drain into a deterministic, path-sorted result
    pub fn into_result(self: Arc<Self>) -> CheckoutResult {
        let mut conflicts = std::mem::take(&mut *self.conflicts.lock());
        conflicts.sort_by(|a, b| a.path.cmp(&b.path));
        let mut changed_paths = std::mem::take(&mut *self.changed_paths.lock());
        changed_paths.sort();
        changed_paths.dedup();
        CheckoutResult {
            conflicts,
            changed_paths,
        }
    }

    /// Tree fetch with accounting
    pub async fn get_tree(&self, hash: Hash) -> Result<Arc<Tree>> {
        self.stats.record_tree_fetch();
        self.inode_ctx.store.get_tree(hash).await
    }

    /// Blob fetch with accounting
    pub async fn get_blob(&self, hash: Hash) -> Result<Arc<Blob>> {
        self.stats.record_blob_fetch();
        self.inode_ctx.store.get_blob(hash).await
    }

    /// Blob SHA-1 fetch with accounting
    pub async fn get_blob_sha1(&self, hash: Hash) -> Result<Sha1Digest> {
        self.stats.record_blob_metadata_fetch();
        self.inode_ctx.store.get_blob_sha1(hash).await
    }
}

/// Join a repo-relative path with a child name
pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        assert!(CheckoutMode::Normal.apply_mutations());
        assert!(CheckoutMode::Force.apply_mutations());
        assert!(!CheckoutMode::DryRun.apply_mutations());
        assert!(CheckoutMode::Force.is_force());
        assert!(!CheckoutMode::Normal.is_force());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("d", "x"), "d/x");
    }

    #[test]
    fn test_conflict_type_display() {
        assert_eq!(ConflictType::UntrackedAdded.to_string(), "UNTRACKED_ADDED");
        assert_eq!(ConflictType::DirectoryNotEmpty.to_string(), "DIRECTORY_NOT_EMPTY");
    }
}
