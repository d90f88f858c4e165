//! In-memory object store
//!
//! Backs tests and the demo command. Objects are inserted programmatically
//! and addressed by a SHA-1 of their serialized form, so identical content
//! deduplicates the way a real store would.

use super::types::{content_sha1, Blob, EntryKind, Hash, Sha1Digest, Tree, TreeEntry};
use super::ObjectStore;
use crate::error::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory content-addressed store
#[derive(Default)]
pub struct MemoryStore {
    trees: DashMap<Hash, Arc<Tree>>,
    blobs: DashMap<Hash, Arc<Blob>>,
    blob_sha1s: DashMap<Hash, Sha1Digest>,
    commits: DashMap<Hash, Hash>,
    commit_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Insert a blob, returning its address
    pub fn add_blob(&self, bytes: impl Into<Bytes>) -> Hash {
        let bytes = bytes.into();
        let sha1 = content_sha1(&bytes);
        // Address the blob by a tagged digest so blob and tree addresses
        // never collide even for identical bytes.
        let mut tagged = Vec::with_capacity(bytes.len() + 5);
        tagged.extend_from_slice(b"blob ");
        tagged.extend_from_slice(&bytes);
        let hash = Hash(content_sha1(&tagged));
        self.blob_sha1s.insert(hash, sha1);
        self.blobs.insert(hash, Arc::new(Blob::new(hash, bytes)));
        hash
    }

    /// Insert a tree from its entries, returning its address
    pub fn add_tree(&self, entries: Vec<TreeEntry>) -> Hash {
        let mut tagged = Vec::new();
        tagged.extend_from_slice(b"tree ");
        for e in &entries {
            tagged.extend_from_slice(e.name.as_bytes());
            tagged.push(0);
            tagged.extend_from_slice(e.hash.as_bytes());
            tagged.push(match e.kind {
                EntryKind::Tree => b't',
                EntryKind::RegularFile => b'f',
                EntryKind::ExecutableFile => b'x',
                EntryKind::Symlink => b'l',
            });
        }
        let hash = Hash(content_sha1(&tagged));
        self.trees.insert(hash, Arc::new(Tree::new(hash, entries)));
        hash
    }

    /// Insert a commit pointing at a root tree, returning the commit hash
    pub fn add_commit(&self, root: Hash) -> Hash {
        let seq = self.commit_counter.fetch_add(1, Ordering::Relaxed);
        let mut tagged = Vec::new();
        tagged.extend_from_slice(b"commit ");
        tagged.extend_from_slice(root.as_bytes());
        tagged.extend_from_slice(&seq.to_be_bytes());
        let hash = Hash(content_sha1(&tagged));
        self.commits.insert(hash, root);
        hash
    }

    /// Build a commit from `(path, content)` pairs of regular files
    pub fn commit_from_files(&self, files: &[(&str, &str)]) -> Hash {
        let specs: Vec<(&str, &str, EntryKind)> = files
            .iter()
            .map(|(p, c)| (*p, *c, EntryKind::RegularFile))
            .collect();
        self.commit_from_entries(&specs)
    }

    /// Build a commit from `(path, content, kind)` triples
    ///
    /// Paths use `/` separators; intermediate trees are created as needed.
    pub fn commit_from_entries(&self, files: &[(&str, &str, EntryKind)]) -> Hash {
        let root = self.build_tree_level(files);
        self.add_commit(root)
    }

    fn build_tree_level(&self, files: &[(&str, &str, EntryKind)]) -> Hash {
        // Group direct children vs deeper paths
        let mut direct: Vec<TreeEntry> = Vec::new();
        let mut subdirs: BTreeMap<&str, Vec<(&str, &str, EntryKind)>> = BTreeMap::new();

        for (path, content, kind) in files {
            match path.split_once('/') {
                None => {
                    let hash = self.add_blob(Bytes::copy_from_slice(content.as_bytes()));
                    direct.push(TreeEntry::new(*path, hash, *kind));
                }
                Some((dir, rest)) => {
                    subdirs.entry(dir).or_default().push((rest, content, *kind));
                }
            }
        }

        for (dir, children) in subdirs {
            let sub_hash = self.build_tree_level(&children);
            direct.push(TreeEntry::new(dir, sub_hash, EntryKind::Tree));
        }

        self.add_tree(direct)
    }
}

impl ObjectStore for MemoryStore {
    fn get_tree(&self, hash: Hash) -> BoxFuture<'_, Result<Arc<Tree>>> {
        Box::pin(async move {
            self.trees
                .get(&hash)
                .map(|t| Arc::clone(&t))
                .ok_or(Error::ObjectNotFound(hash))
        })
    }

    fn get_blob(&self, hash: Hash) -> BoxFuture<'_, Result<Arc<Blob>>> {
        Box::pin(async move {
            self.blobs
                .get(&hash)
                .map(|b| Arc::clone(&b))
                .ok_or(Error::ObjectNotFound(hash))
        })
    }

    fn get_blob_sha1(&self, hash: Hash) -> BoxFuture<'_, Result<Sha1Digest>> {
        Box::pin(async move {
            self.blob_sha1s
                .get(&hash)
                .map(|d| *d)
                .ok_or(Error::ObjectNotFound(hash))
        })
    }

    fn get_commit_root(&self, commit: Hash) -> BoxFuture<'_, Result<Hash>> {
        Box::pin(async move {
            self.commits
                .get(&commit)
                .map(|r| *r)
                .ok_or(Error::CommitNotFound(commit))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_round_trip() {
        let store = MemoryStore::new();
        let hash = store.add_blob("hello");
        let blob = store.get_blob(hash).await.unwrap();
        assert_eq!(&blob.bytes[..], b"hello");
        assert_eq!(
            store.get_blob_sha1(hash).await.unwrap(),
            content_sha1(b"hello")
        );
    }

    #[tokio::test]
    async fn test_identical_blobs_deduplicate() {
        let store = MemoryStore::new();
        assert_eq!(store.add_blob("same"), store.add_blob("same"));
        assert_ne!(store.add_blob("same"), store.add_blob("other"));
    }

    #[tokio::test]
    async fn test_commit_from_files_builds_nested_trees() {
        let store = MemoryStore::new();
        let commit = store.commit_from_files(&[("a", "1"), ("d/x", "2"), ("d/y", "3")]);
        let root = store.get_commit_root(commit).await.unwrap();
        let tree = store.get_tree(root).await.unwrap();

        assert_eq!(tree.entries.len(), 2);
        assert_eq!(tree.entries[0].name, "a");
        assert_eq!(tree.entries[1].name, "d");
        assert!(tree.entries[1].kind.is_tree());

        let sub = store.get_tree(tree.entries[1].hash).await.unwrap();
        let names: Vec<_> = sub.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["x", "y"]);
    }

    #[tokio::test]
    async fn test_missing_object_errors() {
        let store = MemoryStore::new();
        let absent = Hash([9; 20]);
        assert!(matches!(
            store.get_tree(absent).await,
            Err(Error::ObjectNotFound(_))
        ));
        assert!(matches!(
            store.get_commit_root(absent).await,
            Err(Error::CommitNotFound(_))
        ));
    }
}
