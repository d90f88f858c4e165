//! Tree (directory) inodes
//!
//! A tree owns its `DirContents` behind a mutex held only for short
//! structural edits. Mutations take the mount rename lock shared;
//! cross-directory moves take it exclusive. The checkout walk and the
//! status walk add further operations in their own modules.

use super::map::{LoadOutcome, UnloadedInode};
use super::{
    DirContents, DirEntry, EntryState, FileInode, Inode, InodeAttr, InodeContext,
    InodeLocation, InodeNumber, InodeTimestamps,
};
use crate::error::{Error, Result};
use crate::overlay::{InodeMetadata, OverlayDir, OverlayDirEntry};
use crate::store::{EntryKind, Hash, Tree};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Directory size reported by stat; directories have no byte content here
const DIR_SIZE: u64 = 4096;

/// Live directory state: the entry table plus the tree's own hash
pub struct TreeContents {
    pub entries: DirContents,
    /// `Some` while every child is by-hash and this tree matches a
    /// source-control tree; `None` once materialized
    pub source_hash: Option<Hash>,
}

struct TreeMeta {
    mode: u32,
    timestamps: InodeTimestamps,
}

/// One row of a `readdir` listing
#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub name: String,
    pub ino: InodeNumber,
    pub kind: EntryKind,
}

/// Stable enumeration of a directory
pub type DirList = Vec<DirListEntry>;

/// A live directory inode
pub struct TreeInode {
    ino: InodeNumber,
    ctx: Arc<InodeContext>,
    location: Mutex<Option<InodeLocation>>,
    meta: Mutex<TreeMeta>,
    contents: Mutex<TreeContents>,
}

impl TreeInode {
    /// Build the root inode: from overlay data when present, else from the
    /// current commit's root tree, else empty
    pub fn new_root(ctx: Arc<InodeContext>, source: Option<&Tree>) -> Result<Arc<Self>> {
        let ino = InodeNumber::ROOT;
        let mut timestamps = InodeTimestamps::at(ctx.last_checkout_time());
        let mode = EntryKind::Tree.initial_mode();

        let contents = if let Some((dir, ts)) = ctx.overlay.load_dir(ino)? {
            timestamps = ts;
            TreeContents {
                entries: raise_overlay_dir(&dir),
                source_hash: None,
            }
        } else if let Some(tree) = source {
            TreeContents {
                entries: entries_from_tree(tree),
                source_hash: Some(tree.hash),
            }
        } else {
            // Brand-new mount with no commit: an empty materialized root.
            ctx.overlay.save_dir(ino, &Vec::new(), timestamps)?;
            TreeContents {
                entries: DirContents::new(),
                source_hash: None,
            }
        };

        Ok(Arc::new(TreeInode {
            ino,
            ctx,
            location: Mutex::new(None),
            meta: Mutex::new(TreeMeta { mode, timestamps }),
            contents: Mutex::new(contents),
        }))
    }

    /// A child tree backed by a source-control tree object
    pub fn from_source_tree(
        ctx: Arc<InodeContext>,
        ino: InodeNumber,
        location: InodeLocation,
        mode: u32,
        tree: &Tree,
    ) -> Arc<Self> {
        let timestamps = InodeTimestamps::at(ctx.last_checkout_time());
        Arc::new(TreeInode {
            ino,
            ctx,
            location: Mutex::new(Some(location)),
            meta: Mutex::new(TreeMeta { mode, timestamps }),
            contents: Mutex::new(TreeContents {
                entries: entries_from_tree(tree),
                source_hash: Some(tree.hash),
            }),
        })
    }

    /// A child tree backed by overlay data
    pub fn from_overlay(
        ctx: Arc<InodeContext>,
        ino: InodeNumber,
        location: InodeLocation,
        mode: u32,
    ) -> Result<Arc<Self>> {
        let (dir, timestamps) = ctx.overlay.load_dir(ino)?.ok_or(Error::CorruptOverlay {
            ino,
            reason: "materialized directory has no overlay data".to_string(),
        })?;
        let mode = ctx
            .overlay
            .metadata()
            .get(ino)
            .map(|m| m.mode)
            .unwrap_or(mode);
        Ok(Arc::new(TreeInode {
            ino,
            ctx,
            location: Mutex::new(Some(location)),
            meta: Mutex::new(TreeMeta { mode, timestamps }),
            contents: Mutex::new(TreeContents {
                entries: raise_overlay_dir(&dir),
                source_hash: None,
            }),
        }))
    }

    /// A brand-new empty directory, persisted immediately
    pub fn create_empty(
        ctx: Arc<InodeContext>,
        ino: InodeNumber,
        location: InodeLocation,
        mode: u32,
    ) -> Result<Arc<Self>> {
        let timestamps = InodeTimestamps::now();
        ctx.overlay.save_dir(ino, &Vec::new(), timestamps)?;
        ctx.overlay.metadata().set(
            ino,
            InodeMetadata {
                mode,
                uid: ctx.uid,
                gid: ctx.gid,
                timestamps,
            },
        )?;
        Ok(Arc::new(TreeInode {
            ino,
            ctx,
            location: Mutex::new(Some(location)),
            meta: Mutex::new(TreeMeta { mode, timestamps }),
            contents: Mutex::new(TreeContents {
                entries: DirContents::new(),
                source_hash: None,
            }),
        }))
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn context(&self) -> &Arc<InodeContext> {
        &self.ctx
    }

    pub fn mode(&self) -> u32 {
        self.meta.lock().mode
    }

    pub fn location(&self) -> Option<InodeLocation> {
        self.location.lock().clone()
    }

    pub fn set_location(&self, loc: Option<InodeLocation>) {
        *self.location.lock() = loc;
    }

    /// Source-control hash if unmaterialized, else `None`
    pub fn source_hash(&self) -> Option<Hash> {
        self.contents.lock().source_hash
    }

    pub fn is_materialized(&self) -> bool {
        self.contents.lock().source_hash.is_none()
    }

    pub fn getattr(&self) -> InodeAttr {
        let meta = self.meta.lock();
        InodeAttr {
            ino: self.ino,
            size: DIR_SIZE,
            mode: meta.mode,
            timestamps: meta.timestamps,
            kind: EntryKind::Tree,
            nlink: 2,
        }
    }

    /// Run `f` over the contents under the directory mutex
    pub fn with_contents<R>(&self, f: impl FnOnce(&mut TreeContents) -> R) -> R {
        f(&mut self.contents.lock())
    }

    /// Whether any child entry currently has a loaded inode
    pub fn has_loaded_children(&self) -> bool {
        self.contents
            .lock()
            .entries
            .values()
            .any(|e| matches!(e.state, EntryState::Loaded(_)))
    }

    /// Resolve `name` under the mount's case sensitivity to the stored key
    fn resolve_key(&self, contents: &TreeContents, name: &str) -> Option<String> {
        if contents.entries.contains_key(name) {
            return Some(name.to_string());
        }
        if !self.ctx.case_sensitive {
            return contents
                .entries
                .keys()
                .find(|k| self.ctx.names_equal(k, name))
                .cloned();
        }
        None
    }

    /// Materialize an inode object for an existing entry
    ///
    /// Concurrent requests for the same child share one in-flight load via
    /// the inode map's promise list.
    pub async fn get_or_load_child(&self, name: &str) -> Result<Inode> {
        loop {
            // Snapshot what the load needs, allocating the inode number.
            let (key, ino, mode, state_snapshot) = {
                let mut contents = self.contents.lock();
                let key = self
                    .resolve_key(&contents, name)
                    .ok_or_else(|| Error::NoEntry(name.to_string()))?;
                let entry = contents.entries.get_mut(&key).unwrap();
                if let EntryState::Loaded(inode) = &entry.state {
                    return Ok(inode.clone());
                }
                let ino = match entry.ino {
                    Some(ino) => ino,
                    None => {
                        let ino = self.ctx.overlay.allocate_inode_number();
                        entry.ino = Some(ino);
                        ino
                    }
                };
                let snapshot = match &entry.state {
                    EntryState::ByHash(h) => Some(*h),
                    EntryState::Materialized => None,
                    EntryState::Loaded(_) => unreachable!(),
                };
                (key, ino, entry.mode, snapshot)
            };

            match self.ctx.map.begin_load(ino) {
                LoadOutcome::Ready(inode) => {
                    self.adopt_loaded_child(&key, &inode);
                    return Ok(inode);
                }
                LoadOutcome::Pending(rx) => match rx.await {
                    Ok(Ok(inode)) => {
                        self.adopt_loaded_child(&key, &inode);
                        return Ok(inode);
                    }
                    Ok(Err(msg)) => return Err(Error::LoadFailed(msg)),
                    Err(_) => continue,
                },
                LoadOutcome::Start => {
                    let loaded = self
                        .construct_child(&key, ino, mode, state_snapshot)
                        .await;
                    match loaded {
                        Ok(inode) => {
                            self.ctx.map.finish_load(&inode);
                            self.adopt_loaded_child(&key, &inode);
                            return Ok(inode);
                        }
                        Err(e) => {
                            debug!("load of {}/{} failed: {}", self.ino, key, e);
                            let revert = UnloadedInode {
                                parent: self.ino,
                                name: key.clone(),
                                lookup_count: 0,
                                is_dir: EntryKind::from_mode(mode).is_tree(),
                                hash: state_snapshot,
                                mode,
                            };
                            self.ctx.map.fail_load(ino, &e, Some(revert));
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn construct_child(
        &self,
        name: &str,
        ino: InodeNumber,
        mode: u32,
        hash: Option<Hash>,
    ) -> Result<Inode> {
        let location = InodeLocation {
            parent: self.ino,
            name: name.to_string(),
        };
        let is_tree = EntryKind::from_mode(mode).is_tree();
        match (is_tree, hash) {
            (true, Some(h)) => {
                let tree = self.ctx.store.get_tree(h).await?;
                Ok(Inode::Tree(TreeInode::from_source_tree(
                    Arc::clone(&self.ctx),
                    ino,
                    location,
                    mode,
                    &tree,
                )))
            }
            (true, None) => Ok(Inode::Tree(TreeInode::from_overlay(
                Arc::clone(&self.ctx),
                ino,
                location,
                mode,
            )?)),
            (false, Some(h)) => Ok(Inode::File(FileInode::new_unmaterialized(
                Arc::clone(&self.ctx),
                ino,
                location,
                h,
                mode,
            ))),
            (false, None) => Ok(Inode::File(FileInode::open_materialized(
                Arc::clone(&self.ctx),
                ino,
                location,
                mode,
            )?)),
        }
    }

    /// Point the entry at a now-loaded inode, unless the entry moved away
    fn adopt_loaded_child(&self, key: &str, inode: &Inode) {
        let mut contents = self.contents.lock();
        match contents.entries.get_mut(key) {
            Some(entry) if entry.ino == Some(inode.ino()) => {
                entry.state = EntryState::Loaded(inode.clone());
            }
            _ => {
                // Concurrently unlinked or replaced; the inode lives on
                // only through the map until its references drop.
                inode.set_location(None);
            }
        }
    }

    /// Create a regular file (or device node target of `mknod`)
    pub async fn create(&self, name: &str, mode: u32, contents: &[u8]) -> Result<Inode> {
        let _rename = self.ctx.rename_lock.read().await;
        let inode = {
            let mut c = self.contents.lock();
            if self.resolve_key(&c, name).is_some() {
                return Err(Error::EntryExists(name.to_string()));
            }
            let ino = self.ctx.overlay.allocate_inode_number();
            let location = InodeLocation {
                parent: self.ino,
                name: name.to_string(),
            };
            let file =
                FileInode::create_materialized(Arc::clone(&self.ctx), ino, location, mode, contents)?;
            let inode = Inode::File(file);
            c.entries.insert(
                name.to_string(),
                DirEntry {
                    mode,
                    ino: Some(ino),
                    state: EntryState::Loaded(inode.clone()),
                },
            );
            inode
        };
        self.ctx.map.register_loaded(&inode);
        self.touch_and_save()?;
        Ok(inode)
    }

    /// Create a subdirectory
    pub async fn mkdir(&self, name: &str, mode: u32) -> Result<Inode> {
        let _rename = self.ctx.rename_lock.read().await;
        let inode = {
            let mut c = self.contents.lock();
            if self.resolve_key(&c, name).is_some() {
                return Err(Error::EntryExists(name.to_string()));
            }
            let ino = self.ctx.overlay.allocate_inode_number();
            let location = InodeLocation {
                parent: self.ino,
                name: name.to_string(),
            };
            let tree = TreeInode::create_empty(Arc::clone(&self.ctx), ino, location, mode)?;
            let inode = Inode::Tree(tree);
            c.entries.insert(
                name.to_string(),
                DirEntry {
                    mode,
                    ino: Some(ino),
                    state: EntryState::Loaded(inode.clone()),
                },
            );
            inode
        };
        self.ctx.map.register_loaded(&inode);
        self.touch_and_save()?;
        Ok(inode)
    }

    /// Create a symlink; its content is the target path
    pub async fn symlink(&self, name: &str, target: &str) -> Result<Inode> {
        self.create(name, EntryKind::Symlink.initial_mode(), target.as_bytes())
            .await
    }

    /// Remove a non-directory entry
    pub async fn unlink(&self, name: &str) -> Result<()> {
        let _rename = self.ctx.rename_lock.read().await;
        {
            let mut c = self.contents.lock();
            let key = self
                .resolve_key(&c, name)
                .ok_or_else(|| Error::NoEntry(name.to_string()))?;
            let entry = c.entries.get(&key).unwrap();
            if entry.is_tree() {
                return Err(Error::IsADirectory(name.to_string()));
            }
            let entry = c.entries.remove(&key).unwrap();
            self.retire_entry(&entry, false);
        }
        self.touch_and_save()
    }

    /// Remove an empty subdirectory
    pub async fn rmdir(&self, name: &str) -> Result<()> {
        let _rename = self.ctx.rename_lock.read().await;
        {
            let mut c = self.contents.lock();
            let key = self
                .resolve_key(&c, name)
                .ok_or_else(|| Error::NoEntry(name.to_string()))?;
            let entry = c.entries.get(&key).unwrap();
            if !entry.is_tree() {
                return Err(Error::NotADirectory(name.to_string()));
            }
            if !self.dir_entry_is_empty(entry)? {
                return Err(Error::NotEmpty(name.to_string()));
            }
            let entry = c.entries.remove(&key).unwrap();
            // The directory is empty; only its own overlay row can exist.
            self.retire_entry(&entry, false);
        }
        self.touch_and_save()
    }

    /// Whether a tree entry denotes an empty directory
    ///
    /// Source-control trees are never empty, so a by-hash entry counts as
    /// non-empty without a fetch.
    fn dir_entry_is_empty(&self, entry: &DirEntry) -> Result<bool> {
        match &entry.state {
            EntryState::Loaded(Inode::Tree(t)) => Ok(t.contents.lock().entries.is_empty()),
            EntryState::Loaded(Inode::File(_)) => Ok(false),
            EntryState::ByHash(_) => Ok(false),
            EntryState::Materialized => {
                let ino = entry.ino.ok_or_else(|| {
                    Error::Internal("materialized entry without inode number".to_string())
                })?;
                match self.ctx.overlay.load_dir(ino)? {
                    Some((dir, _)) => Ok(dir.is_empty()),
                    None => Ok(true),
                }
            }
        }
    }

    /// Detach a removed entry's inode and overlay data
    pub(crate) fn retire_entry(&self, entry: &DirEntry, recursive: bool) {
        if let EntryState::Loaded(inode) = &entry.state {
            inode.set_location(None);
        }
        if let Some(ino) = entry.ino {
            if self.ctx.map.lookup_count(ino) == 0 {
                self.ctx.map.remove(ino);
            }
            // Overlay data exists only for materialized entries.
            if entry.source_hash().is_none() {
                if recursive {
                    self.ctx.overlay.recursively_remove(ino);
                } else if let Err(e) = self.ctx.overlay.remove(ino) {
                    debug!("failed to drop overlay data for {}: {}", ino, e);
                }
            }
        }
    }

    /// Move an entry, possibly across directories
    ///
    /// Atomic within the mount: same-directory renames hold the rename
    /// lock shared, cross-directory moves hold it exclusive.
    pub async fn rename(
        self: &Arc<Self>,
        old_name: &str,
        new_parent: &Arc<TreeInode>,
        new_name: &str,
    ) -> Result<()> {
        let same_dir = self.ino == new_parent.ino;
        let _shared;
        let _exclusive;
        if same_dir {
            _shared = Some(self.ctx.rename_lock.read().await);
            _exclusive = None;
        } else {
            _shared = None;
            _exclusive = Some(self.ctx.rename_lock.write().await);
        }

        if same_dir {
            let mut c = self.contents.lock();
            let src_key = self
                .resolve_key(&c, old_name)
                .ok_or_else(|| Error::NoEntry(old_name.to_string()))?;
            // Both names resolve to the same entry (identical, or a case
            // variant under the case-insensitive mode): rename(2) says do
            // nothing. Falling through would retire the entry's own
            // overlay data as a "replaced destination".
            if self.resolve_key(&c, new_name).as_deref() == Some(src_key.as_str()) {
                return Ok(());
            }
            let moving = c.entries.get(&src_key).cloned().unwrap();
            self.replace_destination(&mut c, &moving, new_name)?;
            c.entries.remove(&src_key);
            self.record_new_location(&moving, new_parent.ino, new_name);
            c.entries.insert(new_name.to_string(), moving);
        } else {
            // With the rename lock exclusive no other mutation runs, so
            // taking the two directory mutexes in sequence is safe.
            let mut src = self.contents.lock();
            let mut dst = new_parent.contents.lock();

            let src_key = self
                .resolve_key(&src, old_name)
                .ok_or_else(|| Error::NoEntry(old_name.to_string()))?;
            let moving = src.entries.get(&src_key).cloned().unwrap();
            new_parent.replace_destination(&mut dst, &moving, new_name)?;
            src.entries.remove(&src_key);
            self.record_new_location(&moving, new_parent.ino, new_name);
            dst.entries.insert(new_name.to_string(), moving);
        }

        self.touch_and_save()?;
        if !same_dir {
            new_parent.touch_and_save()?;
        }
        Ok(())
    }

    /// Clear the way at the rename destination: types must match and a
    /// directory target must be empty
    fn replace_destination(
        &self,
        contents: &mut TreeContents,
        moving: &DirEntry,
        new_name: &str,
    ) -> Result<()> {
        let dst_key = match self.resolve_key(contents, new_name) {
            Some(k) => k,
            None => return Ok(()),
        };
        let existing = contents.entries.get(&dst_key).unwrap();
        if existing.is_tree() != moving.is_tree() {
            return Err(if existing.is_tree() {
                Error::IsADirectory(new_name.to_string())
            } else {
                Error::NotADirectory(new_name.to_string())
            });
        }
        if existing.is_tree() && !self.dir_entry_is_empty(existing)? {
            return Err(Error::NotEmpty(new_name.to_string()));
        }
        let existing = contents.entries.remove(&dst_key).unwrap();
        self.retire_entry(&existing, false);
        Ok(())
    }

    fn record_new_location(&self, moving: &DirEntry, parent: InodeNumber, name: &str) {
        if let EntryState::Loaded(inode) = &moving.state {
            inode.set_location(Some(InodeLocation {
                parent,
                name: name.to_string(),
            }));
        } else if let Some(ino) = moving.ino {
            self.ctx.map.relocate(ino, parent, name);
        }
    }

    /// Stable enumeration in stored order, starting at `offset`
    pub fn readdir(&self, offset: usize) -> DirList {
        let mut contents = self.contents.lock();
        let mut list = Vec::new();
        let names: Vec<String> = contents.entries.keys().cloned().collect();
        for name in names.into_iter().skip(offset) {
            let entry = contents.entries.get_mut(&name).unwrap();
            let ino = match entry.ino {
                Some(ino) => ino,
                None => {
                    let ino = self.ctx.overlay.allocate_inode_number();
                    entry.ino = Some(ino);
                    ino
                }
            };
            list.push(DirListEntry {
                name,
                ino,
                kind: entry.kind(),
            });
        }
        list
    }

    /// A child inode just became materialized; persist the new entry state
    /// and keep materialization propagating toward the root
    pub fn child_materialized(&self, _name: &str) -> Result<()> {
        let mut newly = self.materialize_and_save()?;
        let mut loc = self.location();
        while newly {
            let Some(l) = loc else { break };
            let parent = self
                .ctx
                .map
                .get_loaded(l.parent)
                .ok_or(Error::InodeNotFound(l.parent))?;
            let parent = parent.as_tree()?.clone();
            newly = parent.materialize_and_save()?;
            loc = parent.location();
        }
        Ok(())
    }

    /// Mark this directory modified and persist it, materializing first
    fn touch_and_save(&self) -> Result<()> {
        self.meta.lock().timestamps.touch_mtime();
        self.child_materialized("")
    }

    /// Write the current entry table to the overlay
    ///
    /// Returns true when this call transitioned the tree from
    /// unmaterialized to materialized.
    pub(crate) fn materialize_and_save(&self) -> Result<bool> {
        let (newly, lowered) = {
            let mut c = self.contents.lock();
            let newly = c.source_hash.take().is_some();
            for entry in c.entries.values_mut() {
                if entry.ino.is_none() {
                    entry.ino = Some(self.ctx.overlay.allocate_inode_number());
                }
            }
            (newly, lower_entries(&c.entries))
        };
        let timestamps = self.meta.lock().timestamps;
        self.ctx.overlay.save_dir(self.ino, &lowered, timestamps)?;
        if newly {
            self.ctx.overlay.metadata().set(
                self.ino,
                InodeMetadata {
                    mode: self.mode(),
                    uid: self.ctx.uid,
                    gid: self.ctx.gid,
                    timestamps,
                },
            )?;
        }
        Ok(newly)
    }

    /// Best-effort unload of unreferenced descendants
    ///
    /// A loaded child with no open handles and no loaded children of its
    /// own reverts to its entry identity so that whole subtrees can be
    /// swapped without per-entry work. A nonzero kernel lookup count keeps
    /// an unloaded descriptor in the map so the number can be re-resolved
    /// through the parent without holding the inode alive.
    pub fn unload_unreferenced(&self) {
        let mut contents = self.contents.lock();
        let keys: Vec<String> = contents.entries.keys().cloned().collect();
        for key in keys {
            let entry = contents.entries.get_mut(&key).unwrap();
            let inode = match &entry.state {
                EntryState::Loaded(inode) => inode.clone(),
                _ => continue,
            };
            let unloadable = match &inode {
                Inode::Tree(t) => {
                    t.unload_unreferenced();
                    !t.has_loaded_children()
                }
                Inode::File(f) => f.is_unloadable(),
            };
            if !unloadable {
                continue;
            }
            let hash = inode.source_hash();
            entry.state = match hash {
                Some(h) => EntryState::ByHash(h),
                None => EntryState::Materialized,
            };
            inode.set_location(None);
            self.ctx.map.make_unloaded(
                inode.ino(),
                UnloadedInode {
                    parent: self.ino,
                    name: key.clone(),
                    lookup_count: self.ctx.map.lookup_count(inode.ino()),
                    is_dir: inode.is_tree(),
                    hash,
                    mode: entry.mode,
                },
            );
        }
    }
}

/// Raise a persisted entry table into live `DirContents`
pub(crate) fn raise_overlay_dir(dir: &OverlayDir) -> DirContents {
    let mut entries = DirContents::new();
    for (name, e) in dir {
        entries.insert(
            name.clone(),
            DirEntry {
                mode: e.mode,
                ino: Some(e.ino),
                state: match e.hash {
                    Some(h) => EntryState::ByHash(h),
                    None => EntryState::Materialized,
                },
            },
        );
    }
    entries
}

/// Lower live `DirContents` to the persisted form
///
/// Callers allocate inode numbers first; entries serialize in map (name)
/// order, which is the stored insertion order.
pub(crate) fn lower_entries(entries: &DirContents) -> OverlayDir {
    entries
        .iter()
        .map(|(name, e)| {
            (
                name.clone(),
                OverlayDirEntry {
                    mode: e.mode,
                    ino: e.ino.expect("inode number allocated before lowering"),
                    hash: e.source_hash(),
                },
            )
        })
        .collect()
}

/// Build live entries from a source-control tree
pub(crate) fn entries_from_tree(tree: &Tree) -> DirContents {
    let mut entries = DirContents::new();
    for e in &tree.entries {
        entries.insert(e.name.clone(), DirEntry::by_hash(e.initial_mode(), e.hash));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TreeEntry;

    #[test]
    fn test_entries_from_tree_uses_kind_modes() {
        let h = Hash([1; 20]);
        let tree = Tree::new(
            h,
            vec![
                TreeEntry::new("bin", Hash([2; 20]), EntryKind::ExecutableFile),
                TreeEntry::new("sub", Hash([3; 20]), EntryKind::Tree),
            ],
        );
        let entries = entries_from_tree(&tree);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["bin"].kind(), EntryKind::ExecutableFile);
        assert!(entries["sub"].is_tree());
        assert!(entries.values().all(|e| e.ino.is_none()));
    }

    #[test]
    fn test_lower_raise_round_trip() {
        let h = Hash([5; 20]);
        let mut entries = DirContents::new();
        entries.insert(
            "clean".to_string(),
            DirEntry {
                mode: EntryKind::RegularFile.initial_mode(),
                ino: Some(InodeNumber(10)),
                state: EntryState::ByHash(h),
            },
        );
        entries.insert(
            "dirty".to_string(),
            DirEntry::materialized(EntryKind::Tree.initial_mode(), InodeNumber(11)),
        );

        let lowered = lower_entries(&entries);
        assert_eq!(lowered[0].0, "clean");
        assert_eq!(lowered[0].1.hash, Some(h));
        assert_eq!(lowered[1].1.hash, None);

        let raised = raise_overlay_dir(&lowered);
        assert_eq!(raised.len(), 2);
        assert_eq!(raised["clean"].ino, Some(InodeNumber(10)));
        assert!(matches!(raised["clean"].state, EntryState::ByHash(_)));
        assert!(matches!(raised["dirty"].state, EntryState::Materialized));
    }
}
