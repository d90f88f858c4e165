//! Live inode model
//!
//! Kernel-facing file and directory objects. Each inode is either backed by
//! a source-control hash ("unmaterialized") or by overlay data
//! ("materialized"); the inode map indexes them by number and carries the
//! kernel lookup counts.

pub mod file;
pub mod map;
pub mod tree;

pub use file::FileInode;
pub use map::{InodeMap, TakeoverData};
pub use tree::{DirList, DirListEntry, TreeInode};

use crate::error::{Error, Result};
use crate::fault::FaultInjector;
use crate::overlay::Overlay;
use crate::store::{EntryKind, Hash, ObjectStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque, monotonically-allocated inode handle
///
/// Stable for the lifetime of the overlay and never reused after
/// retirement.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// The reserved root inode number
    pub const ROOT: InodeNumber = InodeNumber(fuser::FUSE_ROOT_ID);

    pub fn get(self) -> u64 {
        self.0
    }

    /// Overlay shard for this number: the low 8 bits
    pub fn shard(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl From<u64> for InodeNumber {
    fn from(n: u64) -> Self {
        InodeNumber(n)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino:{}", self.0)
    }
}

/// Nanosecond-precision (atime, ctime, mtime) triple
///
/// Persisted in the overlay file header for materialized inodes; in-memory
/// only for unmaterialized ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeTimestamps {
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
}

/// Seconds/nanoseconds since the epoch, as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u64,
}

impl Timespec {
    pub fn from_system_time(t: SystemTime) -> Self {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Timespec {
            sec: d.as_secs(),
            nsec: d.subsec_nanos() as u64,
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.sec, self.nsec as u32)
    }
}

impl InodeTimestamps {
    /// All three fields set to the same instant
    pub fn at(t: SystemTime) -> Self {
        let ts = Timespec::from_system_time(t);
        InodeTimestamps {
            atime: ts,
            ctime: ts,
            mtime: ts,
        }
    }

    pub fn now() -> Self {
        Self::at(SystemTime::now())
    }

    /// Record a content modification
    pub fn touch_mtime(&mut self) {
        let now = Timespec::from_system_time(SystemTime::now());
        self.mtime = now;
        self.ctime = now;
    }
}

/// Where a loaded inode hangs in the tree
#[derive(Debug, Clone)]
pub struct InodeLocation {
    pub parent: InodeNumber,
    pub name: String,
}

/// Identity of a child entry that is not currently loaded
#[derive(Debug, Clone)]
pub enum EntryState {
    /// Backed by a source-control object
    ByHash(Hash),
    /// Backed by overlay data
    Materialized,
    /// A live inode object exists for this entry
    Loaded(Inode),
}

/// One child reference inside a live tree inode
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Full mode bits (type and permissions)
    pub mode: u32,
    /// Allocated lazily, at first load or at directory materialization
    pub ino: Option<InodeNumber>,
    pub state: EntryState,
}

impl DirEntry {
    pub fn by_hash(mode: u32, hash: Hash) -> Self {
        DirEntry {
            mode,
            ino: None,
            state: EntryState::ByHash(hash),
        }
    }

    pub fn materialized(mode: u32, ino: InodeNumber) -> Self {
        DirEntry {
            mode,
            ino: Some(ino),
            state: EntryState::Materialized,
        }
    }

    pub fn is_tree(&self) -> bool {
        self.kind().is_tree()
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_mode(self.mode)
    }

    /// The source-control hash this entry would serialize with, if any
    ///
    /// `None` means the entry (or its loaded inode) is materialized.
    pub fn source_hash(&self) -> Option<Hash> {
        match &self.state {
            EntryState::ByHash(h) => Some(*h),
            EntryState::Materialized => None,
            EntryState::Loaded(inode) => inode.source_hash(),
        }
    }

    pub fn loaded_inode(&self) -> Option<&Inode> {
        match &self.state {
            EntryState::Loaded(inode) => Some(inode),
            _ => None,
        }
    }
}

/// Live directory contents: name to entry, byte-lexicographic order
pub type DirContents = BTreeMap<String, DirEntry>;

/// A live inode, file or directory
#[derive(Clone)]
pub enum Inode {
    File(Arc<FileInode>),
    Tree(Arc<TreeInode>),
}

impl Inode {
    pub fn ino(&self) -> InodeNumber {
        match self {
            Inode::File(f) => f.ino(),
            Inode::Tree(t) => t.ino(),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Inode::Tree(_))
    }

    pub fn as_file(&self) -> Result<&Arc<FileInode>> {
        match self {
            Inode::File(f) => Ok(f),
            Inode::Tree(t) => Err(Error::IsADirectory(t.ino().to_string())),
        }
    }

    pub fn as_tree(&self) -> Result<&Arc<TreeInode>> {
        match self {
            Inode::Tree(t) => Ok(t),
            Inode::File(f) => Err(Error::NotADirectory(f.ino().to_string())),
        }
    }

    /// Source-control hash if unmaterialized, else `None`
    pub fn source_hash(&self) -> Option<Hash> {
        match self {
            Inode::File(f) => f.source_hash(),
            Inode::Tree(t) => t.source_hash(),
        }
    }

    /// Current location in the tree, `None` for the root or after unlink
    pub fn location(&self) -> Option<InodeLocation> {
        match self {
            Inode::File(f) => f.location(),
            Inode::Tree(t) => t.location(),
        }
    }

    pub fn set_location(&self, loc: Option<InodeLocation>) {
        match self {
            Inode::File(f) => f.set_location(loc),
            Inode::Tree(t) => t.set_location(loc),
        }
    }

    pub async fn getattr(&self) -> Result<InodeAttr> {
        match self {
            Inode::File(f) => f.getattr().await,
            Inode::Tree(t) => Ok(t.getattr()),
        }
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inode::File(i) => write!(f, "FileInode({:?})", i.ino()),
            Inode::Tree(i) => write!(f, "TreeInode({:?})", i.ino()),
        }
    }
}

/// Stat-shaped attributes for one inode
#[derive(Debug, Clone)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    pub mode: u32,
    pub timestamps: InodeTimestamps,
    pub kind: EntryKind,
    pub nlink: u32,
}

/// Shared per-mount state every inode can reach
///
/// Owns the overlay, the store handle, and the mount-wide locks the inode
/// layer needs. The mount aggregate wraps this with lifecycle state.
pub struct InodeContext {
    pub overlay: Overlay,
    pub store: Arc<dyn ObjectStore>,
    pub map: InodeMap,
    /// Held shared for in-directory mutations, exclusive across checkout
    pub rename_lock: tokio::sync::RwLock<()>,
    /// Leaf lock: no other lock may be taken beneath it
    last_checkout: Mutex<SystemTime>,
    pub faults: FaultInjector,
    pub case_sensitive: bool,
    /// Owner recorded in the metadata table for materialized inodes
    pub uid: u32,
    pub gid: u32,
}

impl InodeContext {
    pub fn new(overlay: Overlay, store: Arc<dyn ObjectStore>, case_sensitive: bool) -> Self {
        InodeContext {
            overlay,
            store,
            map: InodeMap::new(),
            rename_lock: tokio::sync::RwLock::new(()),
            last_checkout: Mutex::new(SystemTime::now()),
            faults: FaultInjector::new(),
            case_sensitive,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    /// Timestamp seed for unmaterialized inodes
    pub fn last_checkout_time(&self) -> SystemTime {
        *self.last_checkout.lock()
    }

    pub fn set_last_checkout_time(&self, t: SystemTime) {
        *self.last_checkout.lock() = t;
    }

    /// Compare names under the mount's case sensitivity
    pub fn names_equal(&self, a: &str, b: &str) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            a.eq_ignore_ascii_case(b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_number_shard() {
        assert_eq!(InodeNumber(100).shard(), 0x64);
        assert_eq!(InodeNumber(0x1ff).shard(), 0xff);
        assert_eq!(InodeNumber::ROOT.get(), 1);
    }

    #[test]
    fn test_timespec_round_trip() {
        let t = UNIX_EPOCH + Duration::new(1000, 42);
        let ts = Timespec::from_system_time(t);
        assert_eq!(ts.sec, 1000);
        assert_eq!(ts.nsec, 42);
        assert_eq!(ts.to_system_time(), t);
    }

    #[test]
    fn test_dir_entry_source_hash() {
        let h = Hash([7; 20]);
        let by_hash = DirEntry::by_hash(EntryKind::RegularFile.initial_mode(), h);
        assert_eq!(by_hash.source_hash(), Some(h));
        assert!(by_hash.ino.is_none());

        let mat = DirEntry::materialized(EntryKind::Tree.initial_mode(), InodeNumber(9));
        assert_eq!(mat.source_hash(), None);
        assert!(mat.is_tree());
    }
}
