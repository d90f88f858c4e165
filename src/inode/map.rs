//! Inode map
//!
//! Single source of truth for the `InodeNumber` → live-inode mapping of one
//! mount. Mediates asynchronous loads with per-inode promise lists, owns
//! the kernel-visible lookup counts, and can flatten itself for takeover
//! across a graceful restart.

use super::{Inode, InodeContext, InodeNumber};
use crate::error::{Error, Result};
use crate::store::Hash;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Identity kept for an inode that is not currently loaded
///
/// The parent pointer lets the child be re-resolved without holding it
/// alive, which keeps the live graph a tree of owning edges.
#[derive(Debug, Clone)]
pub struct UnloadedInode {
    pub parent: InodeNumber,
    pub name: String,
    pub lookup_count: u64,
    pub is_dir: bool,
    pub hash: Option<Hash>,
    pub mode: u32,
}

type LoadWaiter = oneshot::Sender<std::result::Result<Inode, String>>;

enum MapEntry {
    Loaded { inode: Inode, lookup_count: u64 },
    Unloaded(UnloadedInode),
    Loading {
        waiters: Vec<LoadWaiter>,
        lookup_count: u64,
    },
}

/// What a would-be loader should do next
pub enum LoadOutcome {
    /// Already loaded
    Ready(Inode),
    /// Someone else is loading; await this
    Pending(oneshot::Receiver<std::result::Result<Inode, String>>),
    /// The caller owns the load and must settle it
    Start,
}

/// Process-wide index from inode number to live inode
#[derive(Default)]
pub struct InodeMap {
    entries: Mutex<HashMap<InodeNumber, MapEntry>>,
}

/// Flat takeover snapshot of the map and the allocator watermark
#[derive(Debug, Serialize, Deserialize)]
pub struct TakeoverData {
    pub next_inode: u64,
    pub records: Vec<TakeoverRecord>,
}

/// One inode's identity in the takeover snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct TakeoverRecord {
    pub ino: u64,
    pub parent: u64,
    pub name: String,
    pub lookup_count: u64,
    pub is_dir: bool,
    pub hash: Option<Hash>,
    pub mode: u32,
}

impl InodeMap {
    pub fn new() -> Self {
        InodeMap::default()
    }

    /// The live inode for `ino`, if one is loaded right now
    pub fn get_loaded(&self, ino: InodeNumber) -> Option<Inode> {
        match self.entries.lock().get(&ino) {
            Some(MapEntry::Loaded { inode, .. }) => Some(inode.clone()),
            _ => None,
        }
    }

    /// Record a freshly created inode (create/mkdir paths)
    pub fn register_loaded(&self, inode: &Inode) {
        self.entries.lock().insert(
            inode.ino(),
            MapEntry::Loaded {
                inode: inode.clone(),
                lookup_count: 0,
            },
        );
    }

    /// Join or start the load of `ino`
    pub fn begin_load(&self, ino: InodeNumber) -> LoadOutcome {
        let mut entries = self.entries.lock();
        match entries.get_mut(&ino) {
            Some(MapEntry::Loaded { inode, .. }) => LoadOutcome::Ready(inode.clone()),
            Some(MapEntry::Loading { waiters, .. }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                LoadOutcome::Pending(rx)
            }
            Some(MapEntry::Unloaded(u)) => {
                let lookup_count = u.lookup_count;
                entries.insert(
                    ino,
                    MapEntry::Loading {
                        waiters: Vec::new(),
                        lookup_count,
                    },
                );
                LoadOutcome::Start
            }
            None => {
                entries.insert(
                    ino,
                    MapEntry::Loading {
                        waiters: Vec::new(),
                        lookup_count: 0,
                    },
                );
                LoadOutcome::Start
            }
        }
    }

    /// Settle a successful load, fulfilling every waiter
    pub fn finish_load(&self, inode: &Inode) {
        let mut entries = self.entries.lock();
        let prev = entries.insert(
            inode.ino(),
            MapEntry::Loaded {
                inode: inode.clone(),
                lookup_count: 0,
            },
        );
        if let Some(MapEntry::Loading {
            waiters,
            lookup_count,
        }) = prev
        {
            if let Some(MapEntry::Loaded { lookup_count: lc, .. }) =
                entries.get_mut(&inode.ino())
            {
                *lc = lookup_count;
            }
            drop(entries);
            for w in waiters {
                let _ = w.send(Ok(inode.clone()));
            }
        }
    }

    /// Settle a failed load; every waiter receives the same error
    pub fn fail_load(&self, ino: InodeNumber, error: &Error, revert: Option<UnloadedInode>) {
        let mut entries = self.entries.lock();
        let prev = match revert {
            Some(u) => entries.insert(ino, MapEntry::Unloaded(u)),
            None => entries.remove(&ino),
        };
        drop(entries);
        if let Some(MapEntry::Loading { waiters, .. }) = prev {
            let msg = error.to_string();
            for w in waiters {
                let _ = w.send(Err(msg.clone()));
            }
        }
    }

    /// Kernel lookup-count increment
    pub fn inc_lookup(&self, ino: InodeNumber, n: u64) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&ino) {
            Some(MapEntry::Loaded { lookup_count, .. })
            | Some(MapEntry::Loading { lookup_count, .. }) => *lookup_count += n,
            Some(MapEntry::Unloaded(u)) => u.lookup_count += n,
            None => debug!("inc_lookup on unknown inode {}", ino),
        }
    }

    /// Kernel FORGET: unload is lazy, so a loaded inode stays put even at
    /// a zero count; an unloaded descriptor at zero is dropped
    pub fn forget(&self, ino: InodeNumber, n: u64) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&ino) {
            Some(MapEntry::Loaded { lookup_count, .. })
            | Some(MapEntry::Loading { lookup_count, .. }) => {
                *lookup_count = lookup_count.saturating_sub(n);
            }
            Some(MapEntry::Unloaded(u)) => {
                u.lookup_count = u.lookup_count.saturating_sub(n);
                if u.lookup_count == 0 {
                    entries.remove(&ino);
                }
            }
            None => {}
        }
    }

    pub fn lookup_count(&self, ino: InodeNumber) -> u64 {
        match self.entries.lock().get(&ino) {
            Some(MapEntry::Loaded { lookup_count, .. })
            | Some(MapEntry::Loading { lookup_count, .. }) => *lookup_count,
            Some(MapEntry::Unloaded(u)) => u.lookup_count,
            None => 0,
        }
    }

    /// Replace a loaded entry with an unloaded descriptor
    ///
    /// Drops the descriptor entirely when nothing references it.
    pub fn make_unloaded(&self, ino: InodeNumber, unloaded: UnloadedInode) {
        let mut entries = self.entries.lock();
        if unloaded.lookup_count == 0 {
            entries.remove(&ino);
        } else {
            entries.insert(ino, MapEntry::Unloaded(unloaded));
        }
    }

    /// Drop an inode entirely (unlink with no kernel references)
    pub fn remove(&self, ino: InodeNumber) {
        self.entries.lock().remove(&ino);
    }

    /// Update the parent pointer kept for an unloaded inode (rename path)
    pub fn relocate(&self, ino: InodeNumber, parent: InodeNumber, name: &str) {
        let mut entries = self.entries.lock();
        if let Some(MapEntry::Unloaded(u)) = entries.get_mut(&ino) {
            u.parent = parent;
            u.name = name.to_string();
        }
    }

    /// Number of tracked inodes, the root excluded
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Export the (inode → parent, name, lookup-count) graph
    ///
    /// Every loaded entry flattens to its unloaded identity; the rebuilt
    /// process re-resolves children from parents on demand.
    pub fn serialize_for_takeover(&self, next_inode: u64) -> Result<Vec<u8>> {
        let entries = self.entries.lock();
        let mut records = Vec::with_capacity(entries.len());
        for (ino, entry) in entries.iter() {
            if *ino == InodeNumber::ROOT {
                continue;
            }
            let record = match entry {
                MapEntry::Loaded {
                    inode,
                    lookup_count,
                } => {
                    let loc = match inode.location() {
                        Some(loc) => loc,
                        // Unlinked but still referenced; not resumable.
                        None => continue,
                    };
                    TakeoverRecord {
                        ino: ino.get(),
                        parent: loc.parent.get(),
                        name: loc.name,
                        lookup_count: *lookup_count,
                        is_dir: inode.is_tree(),
                        hash: inode.source_hash(),
                        mode: match inode {
                            Inode::File(f) => f.mode(),
                            Inode::Tree(t) => t.mode(),
                        },
                    }
                }
                MapEntry::Unloaded(u) => TakeoverRecord {
                    ino: ino.get(),
                    parent: u.parent.get(),
                    name: u.name.clone(),
                    lookup_count: u.lookup_count,
                    is_dir: u.is_dir,
                    hash: u.hash,
                    mode: u.mode,
                },
                MapEntry::Loading { .. } => {
                    return Err(Error::Internal(format!(
                        "cannot serialize while inode {} is loading",
                        ino
                    )))
                }
            };
            records.push(record);
        }
        let data = TakeoverData {
            next_inode,
            records,
        };
        bincode::serialize(&data).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Rebuild the map from a takeover snapshot
    pub fn load_from_takeover(&self, data: &TakeoverData) {
        let mut entries = self.entries.lock();
        for r in &data.records {
            entries.insert(
                InodeNumber(r.ino),
                MapEntry::Unloaded(UnloadedInode {
                    parent: InodeNumber(r.parent),
                    name: r.name.clone(),
                    lookup_count: r.lookup_count,
                    is_dir: r.is_dir,
                    hash: r.hash,
                    mode: r.mode,
                }),
            );
        }
    }

    /// Parse takeover bytes
    pub fn parse_takeover(bytes: &[u8]) -> Result<TakeoverData> {
        bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Drop every entry; part of mount shutdown
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl InodeContext {
    /// Resolve an inode number to a live inode, reloading through the
    /// parent chain when necessary
    pub fn lookup_inode(self: &Arc<Self>, ino: InodeNumber) -> BoxFuture<'static, Result<Inode>> {
        let ctx = Arc::clone(self);
        Box::pin(async move {
            loop {
                let unloaded = {
                    let entries = ctx.map.entries.lock();
                    match entries.get(&ino) {
                        Some(MapEntry::Loaded { inode, .. }) => return Ok(inode.clone()),
                        Some(MapEntry::Unloaded(u)) => Some((u.parent, u.name.clone())),
                        Some(MapEntry::Loading { .. }) => None,
                        None => return Err(Error::InodeNotFound(ino)),
                    }
                };

                match unloaded {
                    Some((parent, name)) => {
                        let parent_inode = ctx.lookup_inode(parent).await?;
                        let child = parent_inode.as_tree()?.get_or_load_child(&name).await?;
                        if child.ino() == ino {
                            return Ok(child);
                        }
                        // The name now resolves to a different inode; the
                        // one asked for is gone.
                        return Err(Error::InodeNotFound(ino));
                    }
                    None => {
                        // A load is in flight; join it.
                        let rx = {
                            let mut entries = ctx.map.entries.lock();
                            match entries.get_mut(&ino) {
                                Some(MapEntry::Loading { waiters, .. }) => {
                                    let (tx, rx) = oneshot::channel();
                                    waiters.push(tx);
                                    Some(rx)
                                }
                                _ => None,
                            }
                        };
                        match rx {
                            Some(rx) => match rx.await {
                                Ok(Ok(inode)) => return Ok(inode),
                                Ok(Err(msg)) => return Err(Error::LoadFailed(msg)),
                                Err(_) => continue,
                            },
                            None => continue,
                        }
                    }
                }
            }
        })
    }
}
