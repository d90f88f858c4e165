//! Immutable source-control objects
//!
//! Trees and blobs are content-addressed by a fixed-width hash and never
//! change once fetched, so they are shared freely behind `Arc`.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a content address in bytes
pub const HASH_LEN: usize = 20;

/// Content address of an immutable tree or blob
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Parse from a 40-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| Error::Deserialization(format!("bad hash hex: {}", e)))?;
        let bytes: [u8; HASH_LEN] = raw
            .try_into()
            .map_err(|_| Error::Deserialization(format!("bad hash length in {:?}", s)))?;
        Ok(Hash(bytes))
    }

    /// Raw bytes of the address
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Kind of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Subdirectory
    Tree,
    /// Regular file
    RegularFile,
    /// Regular file with the executable bit
    ExecutableFile,
    /// Symbolic link
    Symlink,
}

impl EntryKind {
    /// Default mode bits for this kind
    pub fn initial_mode(&self) -> u32 {
        match self {
            EntryKind::Tree => libc::S_IFDIR as u32 | 0o755,
            EntryKind::RegularFile => libc::S_IFREG as u32 | 0o644,
            EntryKind::ExecutableFile => libc::S_IFREG as u32 | 0o755,
            EntryKind::Symlink => libc::S_IFLNK as u32 | 0o777,
        }
    }

    /// Recover the kind from full mode bits
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => EntryKind::Tree,
            m if m == libc::S_IFLNK as u32 => EntryKind::Symlink,
            _ if mode & 0o111 != 0 => EntryKind::ExecutableFile,
            _ => EntryKind::RegularFile,
        }
    }

    /// True for subdirectory entries
    pub fn is_tree(&self) -> bool {
        matches!(self, EntryKind::Tree)
    }
}

/// One child reference inside a source-control tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Child name, no separators
    pub name: String,
    /// Address of the child blob or tree
    pub hash: Hash,
    /// Entry kind
    pub kind: EntryKind,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, hash: Hash, kind: EntryKind) -> Self {
        TreeEntry {
            name: name.into(),
            hash,
            kind,
        }
    }

    /// Full mode bits for a freshly checked-out entry of this kind
    pub fn initial_mode(&self) -> u32 {
        self.kind.initial_mode()
    }
}

/// An immutable source-control tree: children sorted by name
#[derive(Debug, Clone)]
pub struct Tree {
    /// This tree's own address
    pub hash: Hash,
    /// Children, sorted lexicographically by byte
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree, enforcing sorted entry order
    pub fn new(hash: Hash, mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        Tree { hash, entries }
    }

    /// Binary-search for a child by name
    pub fn find(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// An immutable source-control blob: the raw file content
#[derive(Debug, Clone)]
pub struct Blob {
    /// This blob's own address
    pub hash: Hash,
    /// File bytes (symlink target bytes for symlinks)
    pub bytes: Bytes,
}

impl Blob {
    pub fn new(hash: Hash, bytes: Bytes) -> Self {
        Blob { hash, bytes }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// SHA-1 digest of blob content, cached beside the store
pub type Sha1Digest = [u8; 20];

/// Compute the content SHA-1 of a byte slice
pub fn content_sha1(data: &[u8]) -> Sha1Digest {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_round_trip() {
        let h = Hash([0xab; HASH_LEN]);
        assert_eq!(h.to_hex(), "ab".repeat(HASH_LEN));
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
        assert!(Hash::from_hex("zz").is_err());
    }

    #[test]
    fn test_entry_kind_modes() {
        assert_eq!(
            EntryKind::from_mode(EntryKind::Tree.initial_mode()),
            EntryKind::Tree
        );
        assert_eq!(
            EntryKind::from_mode(EntryKind::ExecutableFile.initial_mode()),
            EntryKind::ExecutableFile
        );
        assert_eq!(
            EntryKind::from_mode(libc::S_IFREG as u32 | 0o600),
            EntryKind::RegularFile
        );
        assert_eq!(
            EntryKind::from_mode(libc::S_IFLNK as u32 | 0o777),
            EntryKind::Symlink
        );
    }

    #[test]
    fn test_tree_find_sorted() {
        let h = Hash([1; HASH_LEN]);
        let tree = Tree::new(
            h,
            vec![
                TreeEntry::new("zebra", h, EntryKind::RegularFile),
                TreeEntry::new("apple", h, EntryKind::Tree),
            ],
        );
        assert_eq!(tree.entries[0].name, "apple");
        assert!(tree.find("zebra").is_some());
        assert!(tree.find("mango").is_none());
    }

    #[test]
    fn test_content_sha1() {
        // Known digest of "hello"
        assert_eq!(
            hex::encode(content_sha1(b"hello")),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }
}
