//! Per-entry checkout walk
//!
//! The walk zips the sorted name streams of (old tree, new tree, live
//! directory) and classifies each name into a mutation or a conflict.
//! Children of one directory run concurrently; a tree is never its own
//! conflict unit, so conflicts surface at leaves and intact subtrees swap
//! wholesale.

use super::{join_path, CheckoutContext, ConflictType};
use crate::error::Result;
use crate::inode::tree::entries_from_tree;
use crate::inode::{DirEntry, EntryState, Inode, TreeInode};
use crate::store::{Tree, TreeEntry};
use futures::future::BoxFuture;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

impl TreeInode {
    /// Walk this directory against the old and new trees
    ///
    /// Returns the number of conflicts recorded in the subtree, which the
    /// parent uses to decide whether a removal would leave it empty.
    pub fn process_checkout(
        self: &Arc<TreeInode>,
        ctx: &Arc<CheckoutContext>,
        path: String,
        old_tree: Option<Arc<Tree>>,
        new_tree: Option<Arc<Tree>>,
    ) -> BoxFuture<'static, Result<usize>> {
        let this = Arc::clone(self);
        let ctx = Arc::clone(ctx);
        Box::pin(async move {
            ctx.inode_ctx().faults.check("inodeCheckout").await?;

            // Fast path: an untouched, fully-unloaded subtree that still
            // matches the old snapshot swaps wholesale.
            if let (Some(old), Some(new)) = (&old_tree, &new_tree) {
                let swapped = this.with_contents(|c| {
                    let untouched = c.source_hash == Some(old.hash)
                        && !c
                            .entries
                            .values()
                            .any(|e| matches!(e.state, EntryState::Loaded(_)));
                    if untouched && ctx.mode().apply_mutations() && old.hash != new.hash {
                        c.entries = entries_from_tree(new);
                        c.source_hash = Some(new.hash);
                    }
                    untouched
                });
                if swapped {
                    if old.hash != new.hash {
                        ctx.record_changed(&path);
                    }
                    return Ok(0);
                }
            }

            // Slow path: per-entry classification over the name union.
            let live = this.with_contents(|c| c.entries.clone());
            let mut names: BTreeSet<String> = live.keys().cloned().collect();
            if let Some(old) = &old_tree {
                names.extend(old.entries.iter().map(|e| e.name.clone()));
            }
            if let Some(new) = &new_tree {
                names.extend(new.entries.iter().map(|e| e.name.clone()));
            }

            let mut actions = Vec::with_capacity(names.len());
            for name in names {
                let old_e = old_tree.as_ref().and_then(|t| t.find(&name)).cloned();
                let new_e = new_tree.as_ref().and_then(|t| t.find(&name)).cloned();
                let live_e = live.get(&name).cloned();
                let this = Arc::clone(&this);
                let ctx = Arc::clone(&ctx);
                let dir_path = path.clone();
                actions.push(async move {
                    let entry_path = join_path(&dir_path, &name);
                    match this
                        .checkout_one_entry(&ctx, &entry_path, &name, old_e, new_e, live_e)
                        .await
                    {
                        Ok(n) => n,
                        Err(e) => {
                            warn!("checkout failed for {}: {}", entry_path, e);
                            ctx.add_error(&entry_path, &e);
                            1
                        }
                    }
                });
            }
            let conflicts: usize = join_all(actions).await.into_iter().sum();

            // With no new tree this directory is being emptied for removal
            // or replacement; the parent decides whether it survives and
            // finalizes it then, so a discarded directory is never written
            // out first.
            if ctx.mode().apply_mutations() && new_tree.is_some() {
                this.finalize_checkout_dir(new_tree.as_deref())?;
            }
            Ok(conflicts)
        })
    }

    /// Classify and act on one name of this directory
    async fn checkout_one_entry(
        self: &Arc<TreeInode>,
        ctx: &Arc<CheckoutContext>,
        path: &str,
        name: &str,
        old_e: Option<TreeEntry>,
        new_e: Option<TreeEntry>,
        live: Option<DirEntry>,
    ) -> Result<usize> {
        let apply = ctx.mode().apply_mutations();
        let force = ctx.mode().is_force();

        let live = match (old_e, new_e, live) {
            (None, None, None) => return Ok(0),
            // Known to neither snapshot: a locally-added entry.
            (None, None, Some(live)) => {
                return self.handle_untracked(ctx, path, name, live).await;
            }
            (None, Some(new), None) => {
                if apply {
                    self.checkout_update_entry(name, Some(&new));
                }
                ctx.record_changed(path);
                return Ok(0);
            }
            (None, Some(new), Some(_)) => {
                ctx.add_conflict(path, ConflictType::UntrackedAdded);
                if force {
                    self.checkout_update_entry(name, Some(&new));
                    ctx.record_changed(path);
                }
                return Ok(1);
            }
            (Some(old), new_opt, None) => {
                let target_unchanged = new_opt
                    .as_ref()
                    .map_or(false, |n| n.hash == old.hash && n.kind == old.kind);
                if target_unchanged {
                    // The checkout is not touching this path; the local
                    // deletion stands, except under FORCE.
                    if force {
                        self.checkout_update_entry(name, new_opt.as_ref());
                        ctx.record_changed(path);
                    }
                    return Ok(0);
                }
                ctx.add_conflict(path, ConflictType::MissingRemoved);
                if force {
                    self.checkout_update_entry(name, new_opt.as_ref());
                    ctx.record_changed(path);
                }
                return Ok(1);
            }
            (Some(old), new_opt, Some(live)) => (old, new_opt, live),
        };
        let (old, new_opt, live_entry) = live;

        if old.kind.is_tree() && live_entry.is_tree() {
            return self
                .checkout_tree_entry(ctx, path, name, old, new_opt, live_entry)
                .await;
        }

        if old.kind.is_tree() != live_entry.is_tree() {
            // The user swapped a file for a directory or vice versa; the
            // walk cannot descend, so it is one modified leaf.
            ctx.add_conflict(path, ConflictType::Modified);
            if force {
                self.checkout_update_entry(name, new_opt.as_ref());
                ctx.record_changed(path);
            }
            return Ok(1);
        }

        // File against file (or file against removal / type swap).
        let modified = self.file_entry_modified(name, &old, &live_entry).await?;
        let target_unchanged = new_opt
            .as_ref()
            .map_or(false, |n| n.hash == old.hash && n.kind == old.kind);

        if !modified {
            if target_unchanged {
                return Ok(0);
            }
            if apply {
                self.checkout_update_entry(name, new_opt.as_ref());
            }
            ctx.record_changed(path);
            return Ok(0);
        }

        ctx.add_conflict(path, ConflictType::Modified);
        if force {
            self.checkout_update_entry(name, new_opt.as_ref());
            ctx.record_changed(path);
        }
        Ok(1)
    }

    /// Old and live are both trees: recurse, then apply any type swap or
    /// removal once the subtree has been handled
    async fn checkout_tree_entry(
        self: &Arc<TreeInode>,
        ctx: &Arc<CheckoutContext>,
        path: &str,
        name: &str,
        old: TreeEntry,
        new_opt: Option<TreeEntry>,
        live_entry: DirEntry,
    ) -> Result<usize> {
        let apply = ctx.mode().apply_mutations();
        let force = ctx.mode().is_force();
        let new_is_tree = new_opt.as_ref().map_or(false, |n| n.kind.is_tree());

        // Entry-level fast path: the subtree is unloaded and untouched.
        if let EntryState::ByHash(h) = &live_entry.state {
            if *h == old.hash {
                if new_is_tree {
                    let new = new_opt.as_ref().unwrap();
                    if new.hash != *h {
                        if apply {
                            self.checkout_update_entry(name, Some(new));
                        }
                        ctx.record_changed(path);
                    }
                    return Ok(0);
                }
                // The target replaces the whole subtree with a file, or
                // removes it; nothing below is modified.
                if apply {
                    self.checkout_update_entry(name, new_opt.as_ref());
                }
                ctx.record_changed(path);
                return Ok(0);
            }
        }

        // Load the child and both subtrees; the fetches join before the
        // recursion dispatches.
        let new_fut = async {
            match &new_opt {
                Some(n) if n.kind.is_tree() => Ok(Some(ctx.get_tree(n.hash).await?)),
                _ => Ok::<_, crate::error::Error>(None),
            }
        };
        let (old_sub, new_sub) = tokio::try_join!(ctx.get_tree(old.hash), new_fut)?;
        let child = self.get_or_load_child(name).await?;
        let child = match child {
            Inode::Tree(t) => t,
            Inode::File(_) => {
                // Raced with a local type swap since the snapshot.
                ctx.add_conflict(path, ConflictType::Modified);
                return Ok(1);
            }
        };

        let conflicts = child
            .process_checkout(ctx, path.to_string(), Some(old_sub), new_sub.clone())
            .await?;

        if new_is_tree {
            return Ok(conflicts);
        }

        // Directory replaced by a file, or removed outright.
        let now_empty = child.with_contents(|c| c.entries.is_empty());
        let would_be_empty = if apply { now_empty } else { conflicts == 0 };
        if would_be_empty {
            if apply {
                self.checkout_update_entry(name, new_opt.as_ref());
            }
            ctx.record_changed(path);
            Ok(conflicts)
        } else {
            // The directory survives; persist the removals that applied.
            if apply {
                child.finalize_checkout_dir(None)?;
            }
            if new_opt.is_some() {
                debug!("directory {} still has entries; cannot place file", path);
                ctx.add_conflict(path, ConflictType::DirectoryNotEmpty);
                Ok(conflicts + 1)
            } else {
                Ok(conflicts)
            }
        }
    }

    /// A locally-added entry in the way of (or invisible to) the target
    async fn handle_untracked(
        self: &Arc<TreeInode>,
        ctx: &Arc<CheckoutContext>,
        path: &str,
        name: &str,
        live: DirEntry,
    ) -> Result<usize> {
        let force = ctx.mode().is_force();
        if live.is_tree() {
            // Conflicts are reported at leaves; recurse with no trees on
            // either side so every file below surfaces individually.
            let child = match self.get_or_load_child(name).await? {
                Inode::Tree(t) => t,
                Inode::File(_) => {
                    ctx.add_conflict(path, ConflictType::UntrackedAdded);
                    return Ok(1);
                }
            };
            let conflicts = child
                .process_checkout(ctx, path.to_string(), None, None)
                .await?;
            if force {
                if child.with_contents(|c| c.entries.is_empty()) {
                    self.checkout_update_entry(name, None);
                    ctx.record_changed(path);
                } else {
                    // Something below survived (e.g. a load error); keep
                    // the directory consistent on disk.
                    child.finalize_checkout_dir(None)?;
                }
            }
            Ok(conflicts)
        } else {
            ctx.add_conflict(path, ConflictType::UntrackedAdded);
            if force {
                self.checkout_update_entry(name, None);
                ctx.record_changed(path);
            }
            Ok(1)
        }
    }

    /// Does the live file differ from the old snapshot's entry?
    ///
    /// Hash comparison when unmaterialized; otherwise the inode's
    /// `is_same_as` (SHA-1, then bytes) decides.
    async fn file_entry_modified(
        self: &Arc<TreeInode>,
        name: &str,
        old: &TreeEntry,
        live: &DirEntry,
    ) -> Result<bool> {
        match &live.state {
            EntryState::ByHash(h) => Ok(*h != old.hash || live.kind() != old.kind),
            EntryState::Loaded(Inode::File(f)) => Ok(!f.is_same_as(old.hash, old.kind).await?),
            EntryState::Loaded(Inode::Tree(_)) => Ok(true),
            EntryState::Materialized => {
                let inode = self.get_or_load_child(name).await?;
                match inode {
                    Inode::File(f) => Ok(!f.is_same_as(old.hash, old.kind).await?),
                    Inode::Tree(_) => Ok(true),
                }
            }
        }
    }

    /// The mutation primitive: replace or remove one entry
    ///
    /// The caller holds the mount rename lock exclusively; the directory
    /// itself is saved once the whole directory walk finishes.
    pub(crate) fn checkout_update_entry(&self, name: &str, new_entry: Option<&TreeEntry>) {
        let retired = self.with_contents(|c| {
            let old = c.entries.remove(name);
            if let Some(new_e) = new_entry {
                c.entries.insert(
                    name.to_string(),
                    DirEntry::by_hash(new_e.initial_mode(), new_e.hash),
                );
            }
            old
        });
        if let Some(old) = retired {
            self.retire_entry(&old, old.is_tree());
        }
    }

    /// Settle this directory's identity after its walk completes
    ///
    /// A directory that stayed unmaterialized and now mirrors the new tree
    /// adopts the new hash; anything else is persisted to the overlay.
    pub(crate) fn finalize_checkout_dir(&self, new_tree: Option<&Tree>) -> Result<()> {
        if let Some(new) = new_tree {
            let adopted = self.with_contents(|c| {
                if c.source_hash.is_none() {
                    return false;
                }
                let mirrors = c.entries.len() == new.entries.len()
                    && new.entries.iter().all(|e| {
                        c.entries.get(&e.name).map_or(false, |le| {
                            le.source_hash() == Some(e.hash) && le.mode == e.initial_mode()
                        })
                    });
                if mirrors {
                    c.source_hash = Some(new.hash);
                }
                mirrors
            });
            if adopted {
                return Ok(());
            }
        }
        self.materialize_and_save()?;
        Ok(())
    }
}
