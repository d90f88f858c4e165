//! Content-addressed object store interface
//!
//! The store hands out immutable trees and blobs by hash. Fetches are
//! asynchronous; the inode layer never blocks a dispatcher thread on them.

mod memory;
mod types;

pub use memory::MemoryStore;
pub use types::{content_sha1, Blob, EntryKind, Hash, Sha1Digest, Tree, TreeEntry, HASH_LEN};

use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// By-hash fetch of immutable source-control objects
pub trait ObjectStore: Send + Sync {
    /// Fetch a tree object
    fn get_tree(&self, hash: Hash) -> BoxFuture<'_, Result<Arc<Tree>>>;

    /// Fetch a blob object
    fn get_blob(&self, hash: Hash) -> BoxFuture<'_, Result<Arc<Blob>>>;

    /// Content SHA-1 of a blob, without fetching the bytes when possible
    fn get_blob_sha1(&self, hash: Hash) -> BoxFuture<'_, Result<Sha1Digest>>;

    /// Resolve a commit hash to its root tree hash
    fn get_commit_root(&self, commit: Hash) -> BoxFuture<'_, Result<Hash>>;
}

/// Counters for store traffic during one operation (e.g. a checkout)
#[derive(Debug, Default)]
pub struct FetchStats {
    trees: AtomicU64,
    blobs: AtomicU64,
    blob_metadata: AtomicU64,
}

impl FetchStats {
    pub fn new() -> Self {
        FetchStats::default()
    }

    pub fn record_tree_fetch(&self) {
        self.trees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blob_fetch(&self) {
        self.blobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blob_metadata_fetch(&self) {
        self.blob_metadata.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tree_fetches(&self) -> u64 {
        self.trees.load(Ordering::Relaxed)
    }

    pub fn blob_fetches(&self) -> u64 {
        self.blobs.load(Ordering::Relaxed)
    }

    pub fn blob_metadata_fetches(&self) -> u64 {
        self.blob_metadata.load(Ordering::Relaxed)
    }
}
