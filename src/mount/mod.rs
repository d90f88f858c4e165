//! Mount aggregate
//!
//! Owns the root tree inode, the inode map, the overlay, and the current
//! parent commit, and serializes checkouts. Lifecycle transitions are
//! atomic compare-and-swap; an illegal transition is a bug and aborts.

use crate::checkout::{CheckoutContext, CheckoutMode, CheckoutResult};
use crate::config::Config;
use crate::diff::{DiffCollector, DiffContext, DiffResult, IgnoreStack};
use crate::error::{Error, Result};
use crate::inode::{Inode, InodeContext, InodeMap, TreeInode};
use crate::journal::Journal;
use crate::overlay::Overlay;
use crate::store::{Hash, ObjectStore, Tree};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Mount lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MountState {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    InitError = 3,
    Starting = 4,
    Running = 5,
    FuseError = 6,
    ShuttingDown = 7,
    ShutDown = 8,
    Destroying = 9,
}

impl MountState {
    fn from_u8(v: u8) -> MountState {
        match v {
            0 => MountState::Uninitialized,
            1 => MountState::Initializing,
            2 => MountState::Initialized,
            3 => MountState::InitError,
            4 => MountState::Starting,
            5 => MountState::Running,
            6 => MountState::FuseError,
            7 => MountState::ShuttingDown,
            8 => MountState::ShutDown,
            9 => MountState::Destroying,
            _ => unreachable!("invalid mount state {}", v),
        }
    }

    fn can_transition_to(self, to: MountState) -> bool {
        use MountState::*;
        // DESTROYING is reachable from any state.
        if to == Destroying {
            return true;
        }
        matches!(
            (self, to),
            (Uninitialized, Initializing)
                | (Initializing, Initialized)
                | (Initializing, InitError)
                | (Initialized, Starting)
                | (Starting, Running)
                | (Starting, FuseError)
                | (Running, ShuttingDown)
                | (FuseError, ShuttingDown)
                | (Initialized, ShuttingDown)
                | (ShuttingDown, ShutDown)
        )
    }
}

/// Process-wide mount generation: pid ⊕ time ⊕ counter
static GENERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_mount_generation() -> u64 {
    let pid = std::process::id() as u64;
    let time = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let counter = GENERATION_COUNTER.fetch_add(1, Ordering::AcqRel);
    pid ^ time ^ counter
}

/// A lease on the tree-prefetch concurrency budget
pub struct TreePrefetchLease {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// The mount: root inode, inode map, overlay, parent commit, journal
pub struct RevMount {
    ctx: Arc<InodeContext>,
    root: Arc<TreeInode>,
    /// Write-held across checkout; guards the parent-commit record
    parents: RwLock<Vec<Hash>>,
    state: AtomicU8,
    journal: Journal,
    unmount_started: AtomicBool,
    generation: u64,
    parents_path: PathBuf,
    checkout_lock_timeout: Duration,
    prefetch_permits: Arc<Semaphore>,
    uid: u32,
    gid: u32,
}

impl RevMount {
    /// Initialize a mount from its on-disk state
    pub async fn new(config: &Config, store: Arc<dyn ObjectStore>) -> Result<Arc<RevMount>> {
        Self::initialize(config, store, None).await
    }

    /// Initialize a mount, inheriting inode state from a takeover snapshot
    pub async fn new_from_takeover(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        takeover: &[u8],
    ) -> Result<Arc<RevMount>> {
        Self::initialize(config, store, Some(takeover)).await
    }

    async fn initialize(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        takeover: Option<&[u8]>,
    ) -> Result<Arc<RevMount>> {
        let state = AtomicU8::new(MountState::Uninitialized as u8);
        transition(&state, MountState::Uninitialized, MountState::Initializing);

        let result = Self::initialize_inner(config, store, takeover).await;
        match result {
            Ok((ctx, root, parents)) => {
                transition(&state, MountState::Initializing, MountState::Initialized);
                let mount = Arc::new(RevMount {
                    ctx,
                    root,
                    parents: RwLock::new(parents),
                    state,
                    journal: Journal::new(),
                    unmount_started: AtomicBool::new(false),
                    generation: next_mount_generation(),
                    parents_path: config.parents_file(),
                    checkout_lock_timeout: Duration::from_millis(config.checkout.lock_timeout_ms),
                    prefetch_permits: Arc::new(Semaphore::new(
                        config.prefetch.max_concurrent_tree_prefetches,
                    )),
                    uid: config.mount.uid,
                    gid: config.mount.gid,
                });
                info!(
                    "mount initialized (generation {:x}, parents {:?})",
                    mount.generation,
                    mount.parents.try_read().map(|p| p.len()).unwrap_or(0)
                );
                Ok(mount)
            }
            Err(e) => {
                transition(&state, MountState::Initializing, MountState::InitError);
                Err(e)
            }
        }
    }

    async fn initialize_inner(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        takeover: Option<&[u8]>,
    ) -> Result<(Arc<InodeContext>, Arc<TreeInode>, Vec<Hash>)> {
        config.ensure_directories()?;
        let overlay = Overlay::open(config.overlay_dir())?;
        let parents = read_parents(&config.parents_file())?;

        let ctx = Arc::new(InodeContext::new(
            overlay,
            store,
            config.overlay.case_sensitive,
        ));
        ctx.faults.check("mount").await?;

        if let Some(bytes) = takeover {
            let data = InodeMap::parse_takeover(bytes)?;
            ctx.overlay.ensure_next_inode_at_least(data.next_inode);
            ctx.map.load_from_takeover(&data);
            debug!("restored {} inodes from takeover", data.records.len());
        }

        // The root comes from the overlay when materialized, else from the
        // current parent commit's root tree.
        let root_tree = if ctx.overlay.has_data(crate::inode::InodeNumber::ROOT) {
            None
        } else {
            match parents.first() {
                Some(commit) => {
                    let root_hash = ctx.store.get_commit_root(*commit).await?;
                    Some(ctx.store.get_tree(root_hash).await?)
                }
                None => None,
            }
        };
        let root = TreeInode::new_root(Arc::clone(&ctx), root_tree.as_deref())?;
        ctx.map.register_loaded(&Inode::Tree(Arc::clone(&root)));

        Ok((ctx, root, parents))
    }

    /// Begin serving: `INITIALIZED → STARTING → RUNNING`
    ///
    /// Fails with `CANCELLED` if an unmount began during startup.
    pub fn start(&self) -> Result<()> {
        transition(&self.state, MountState::Initialized, MountState::Starting);
        if self.unmount_started.load(Ordering::Acquire) {
            transition(&self.state, MountState::Starting, MountState::FuseError);
            return Err(Error::Cancelled);
        }
        transition(&self.state, MountState::Starting, MountState::Running);
        Ok(())
    }

    pub fn state(&self) -> MountState {
        MountState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn root(&self) -> &Arc<TreeInode> {
        &self.root
    }

    pub fn context(&self) -> &Arc<InodeContext> {
        &self.ctx
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Reported ownership for kernel-facing attributes
    pub fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    /// Current parent commits (usually exactly one)
    pub async fn parent_commits(&self) -> Vec<Hash> {
        self.parents.read().await.clone()
    }

    /// Mark that an unmount began; observed by startup stages
    pub fn begin_unmount(&self) {
        self.unmount_started.store(true, Ordering::Release);
    }

    /// Transform the working tree to the target commit
    pub async fn checkout(
        self: &Arc<Self>,
        target: Hash,
        mode: CheckoutMode,
    ) -> Result<CheckoutResult> {
        self.ctx.faults.check("checkout").await?;

        // Exactly one checkout per mount makes progress at a time.
        let mut parents = tokio::time::timeout(self.checkout_lock_timeout, self.parents.write())
            .await
            .map_err(|_| Error::CheckoutInProgress)?;

        let old_commit = parents.first().copied();
        let (old_tree, new_tree) = self.fetch_checkout_roots(old_commit, target).await?;
        info!(
            "checkout {:?} -> {} ({:?})",
            old_commit.map(|h| h.to_string()),
            target,
            mode
        );

        // Pre-diff against the working tree so the journal can record the
        // paths that were locally modified at checkout time.
        let unclean_paths = if mode.apply_mutations() {
            let status = self.diff_working_tree(old_tree.clone(), false).await?;
            let mut paths = status.untracked;
            paths.extend(status.removed);
            paths.extend(status.modified);
            paths.sort();
            paths
        } else {
            Vec::new()
        };

        // Exclusive rename lock for the whole walk; unloading unreferenced
        // inodes first lets intact subtrees swap without per-entry work.
        let _rename = self.ctx.rename_lock.write().await;
        self.root.unload_unreferenced();

        let cctx = CheckoutContext::new(Arc::clone(&self.ctx), mode);
        self.root
            .process_checkout(&cctx, String::new(), old_tree, Some(new_tree))
            .await?;

        debug!(
            "checkout fetched {} trees, {} blobs",
            cctx.stats.tree_fetches(),
            cctx.stats.blob_fetches()
        );
        let result = cctx.into_result();

        if mode.apply_mutations() {
            *parents = vec![target];
            write_parents(&self.parents_path, &parents)?;
            self.ctx.set_last_checkout_time(SystemTime::now());
            self.journal.record_checkout(
                old_commit,
                target,
                result.changed_paths.clone(),
                unclean_paths,
            );
        }

        Ok(result)
    }

    async fn fetch_checkout_roots(
        &self,
        old_commit: Option<Hash>,
        target: Hash,
    ) -> Result<(Option<Arc<Tree>>, Arc<Tree>)> {
        let old_fut = async {
            match old_commit {
                Some(commit) => {
                    let hash = self.ctx.store.get_commit_root(commit).await?;
                    Ok::<_, Error>(Some(self.ctx.store.get_tree(hash).await?))
                }
                None => Ok(None),
            }
        };
        let new_fut = async {
            let hash = self.ctx.store.get_commit_root(target).await?;
            self.ctx.store.get_tree(hash).await
        };
        let (old_tree, new_tree) = tokio::try_join!(old_fut, new_fut)?;
        Ok((old_tree, new_tree))
    }

    /// Working-tree status against a commit
    pub async fn diff(
        self: &Arc<Self>,
        commit: Hash,
        list_ignored: bool,
        enforce_current_parent: bool,
    ) -> Result<DiffResult> {
        if enforce_current_parent {
            let parents = self.parents.read().await;
            match parents.first() {
                Some(current) if *current == commit => {}
                Some(current) => {
                    return Err(Error::OutOfDateParent {
                        requested: commit,
                        current: *current,
                    })
                }
                None => {
                    return Err(Error::MountNotRunning(
                        "mount has no parent commit".to_string(),
                    ))
                }
            }
        }

        let root_hash = self.ctx.store.get_commit_root(commit).await?;
        let tree = self.ctx.store.get_tree(root_hash).await?;
        self.diff_working_tree(Some(tree), list_ignored).await
    }

    async fn diff_working_tree(
        self: &Arc<Self>,
        source: Option<Arc<Tree>>,
        list_ignored: bool,
    ) -> Result<DiffResult> {
        let collector = DiffCollector::new();
        let dctx = Arc::new(DiffContext {
            callback: collector.clone(),
            inode_ctx: Arc::clone(&self.ctx),
            list_ignored,
        });
        self.root
            .diff(&dctx, String::new(), source, IgnoreStack::new(), false)
            .await?;
        Ok(collector.into_result())
    }

    /// Move the mount to new parent commits without touching the tree
    pub async fn reset_parents(&self, new_parents: Vec<Hash>) -> Result<()> {
        for commit in &new_parents {
            self.ctx.store.get_commit_root(*commit).await?;
        }
        let mut parents = self.parents.write().await;
        *parents = new_parents;
        write_parents(&self.parents_path, &parents)
    }

    /// Take a lease on the prefetch budget, or decline
    pub fn try_start_tree_prefetch(&self) -> Option<TreePrefetchLease> {
        Arc::clone(&self.prefetch_permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| TreePrefetchLease { _permit: permit })
    }

    /// Warm the blobs of one directory's unmaterialized files
    pub async fn prefetch_tree(&self, tree: &Arc<TreeInode>, lease: TreePrefetchLease) {
        let hashes: Vec<Hash> = tree.with_contents(|c| {
            c.entries
                .values()
                .filter(|e| !e.is_tree())
                .filter_map(|e| e.source_hash())
                .collect()
        });
        for hash in hashes {
            if let Err(e) = self.ctx.store.get_blob(hash).await {
                debug!("prefetch of {} failed: {}", hash, e);
            }
        }
        drop(lease);
    }

    /// Release in-process state; separable from unmount
    ///
    /// With `do_takeover`, the inode graph and allocator watermark are
    /// returned so a successor process can inherit the kernel connection.
    pub async fn shutdown(&self, do_takeover: bool) -> Result<Option<Vec<u8>>> {
        let from = self.state();
        if !matches!(
            from,
            MountState::Running | MountState::FuseError | MountState::Initialized
        ) {
            return Err(Error::MountNotRunning(format!("{:?}", from)));
        }
        transition(&self.state, from, MountState::ShuttingDown);

        self.journal.cancel_subscribers();

        let takeover = if do_takeover {
            let next = self.ctx.overlay.next_inode_number().get();
            Some(self.ctx.map.serialize_for_takeover(next)?)
        } else {
            None
        };

        // Drain the inode map: unload everything unreferenced, then drop
        // the remaining entries with the map itself.
        self.root.unload_unreferenced();
        let remaining = self.ctx.map.len();
        if remaining > 1 {
            debug!("{} inodes still referenced at shutdown", remaining);
        }
        self.ctx.map.clear();

        self.ctx.overlay.close()?;
        transition(&self.state, MountState::ShuttingDown, MountState::ShutDown);
        info!("mount shut down");
        Ok(takeover)
    }
}

/// CAS transition; an illegal transition aborts the process
fn transition(state: &AtomicU8, from: MountState, to: MountState) {
    if !from.can_transition_to(to) {
        panic!("illegal mount state transition {:?} -> {:?}", from, to);
    }
    if state
        .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        let actual = MountState::from_u8(state.load(Ordering::Acquire));
        panic!(
            "mount state changed underneath transition {:?} -> {:?} (now {:?})",
            from, to, actual
        );
    }
}

fn read_parents(path: &PathBuf) -> Result<Vec<Hash>> {
    match fs::read_to_string(path) {
        Ok(text) => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Hash::from_hex(l.trim()))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_parents(path: &PathBuf, parents: &[Hash]) -> Result<()> {
    let mut text = String::new();
    for p in parents {
        text.push_str(&p.to_hex());
        text.push('\n');
    }
    let tmp = path.with_extension("tmp");
    let result = (|| -> Result<()> {
        fs::write(&tmp, &text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        warn!("failed to persist parent commits");
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transition_table() {
        use MountState::*;
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Initialized));
        assert!(Initializing.can_transition_to(InitError));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(FuseError.can_transition_to(Destroying));
        assert!(!Running.can_transition_to(Initialized));
        assert!(!ShutDown.can_transition_to(Running));
    }

    #[test]
    fn test_generation_is_unique() {
        let a = next_mount_generation();
        let b = next_mount_generation();
        assert_ne!(a, b);
    }
}
