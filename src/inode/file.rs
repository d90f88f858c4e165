//! File inodes
//!
//! A file is either backed by a source-control blob (NOT_LOADED, LOADING,
//! LOADED) or by an overlay file (MATERIALIZED). The first write forces the
//! transition to MATERIALIZED and propagates materialization to the parent
//! directory. MATERIALIZED is terminal until the file is unlinked.

use super::{
    InodeAttr, InodeContext, InodeLocation, InodeNumber, InodeTimestamps, Timespec,
};
use crate::error::{Error, Result};
use crate::overlay::{InodeMetadata, HEADER_SIZE};
use crate::store::{content_sha1, EntryKind, Hash, Sha1Digest};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::debug;

/// Blob content or an error message shared by every waiter on one load
type LoadResult = std::result::Result<Bytes, String>;

enum FileState {
    /// Hash known, content not in memory
    NotLoaded { hash: Hash },
    /// A fetch is in flight; later readers queue here
    Loading {
        hash: Hash,
        waiters: Vec<oneshot::Sender<LoadResult>>,
    },
    /// Immutable blob content in memory
    Loaded { hash: Hash, blob: Bytes },
    /// Backed by an open overlay file; the source-control hash is gone
    Materialized {
        file: File,
        size: u64,
        sha1: Option<Sha1Digest>,
    },
}

struct FileMeta {
    mode: u32,
    timestamps: InodeTimestamps,
}

/// Desired attribute changes for `setattr`
#[derive(Debug, Default, Clone, Copy)]
pub struct DesiredAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Hint for `read_link`: will the kernel cache the target?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLinkCache {
    /// Kernel caches the result; release the blob after reading
    Kernel,
    /// Keep the blob warm for further reads
    Keep,
}

/// A live file inode
pub struct FileInode {
    ino: InodeNumber,
    ctx: Arc<InodeContext>,
    location: Mutex<Option<InodeLocation>>,
    meta: Mutex<FileMeta>,
    state: Mutex<FileState>,
    open_handles: std::sync::atomic::AtomicU32,
}

impl FileInode {
    /// An inode whose content is defined by a source-control blob
    pub fn new_unmaterialized(
        ctx: Arc<InodeContext>,
        ino: InodeNumber,
        location: InodeLocation,
        hash: Hash,
        mode: u32,
    ) -> Arc<Self> {
        let timestamps = InodeTimestamps::at(ctx.last_checkout_time());
        Arc::new(FileInode {
            ino,
            ctx,
            location: Mutex::new(Some(location)),
            meta: Mutex::new(FileMeta { mode, timestamps }),
            state: Mutex::new(FileState::NotLoaded { hash }),
            open_handles: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Reopen a materialized inode from its overlay data
    pub fn open_materialized(
        ctx: Arc<InodeContext>,
        ino: InodeNumber,
        location: InodeLocation,
        mode: u32,
    ) -> Result<Arc<Self>> {
        let (file, timestamps) = ctx.overlay.open_file(ino)?;
        let size = file.metadata()?.len().saturating_sub(HEADER_SIZE as u64);
        let mode = ctx
            .overlay
            .metadata()
            .get(ino)
            .map(|m| m.mode)
            .unwrap_or(mode);
        Ok(Arc::new(FileInode {
            ino,
            ctx,
            location: Mutex::new(Some(location)),
            meta: Mutex::new(FileMeta { mode, timestamps }),
            state: Mutex::new(FileState::Materialized {
                file,
                size,
                sha1: None,
            }),
            open_handles: std::sync::atomic::AtomicU32::new(0),
        }))
    }

    /// Create a brand-new materialized inode with the given content
    pub fn create_materialized(
        ctx: Arc<InodeContext>,
        ino: InodeNumber,
        location: InodeLocation,
        mode: u32,
        contents: &[u8],
    ) -> Result<Arc<Self>> {
        let timestamps = InodeTimestamps::now();
        let file = ctx.overlay.create_file(ino, timestamps, contents)?;
        ctx.overlay.metadata().set(
            ino,
            InodeMetadata {
                mode,
                uid: ctx.uid,
                gid: ctx.gid,
                timestamps,
            },
        )?;
        Ok(Arc::new(FileInode {
            ino,
            ctx,
            location: Mutex::new(Some(location)),
            meta: Mutex::new(FileMeta { mode, timestamps }),
            state: Mutex::new(FileState::Materialized {
                file,
                size: contents.len() as u64,
                sha1: Some(content_sha1(contents)),
            }),
            open_handles: std::sync::atomic::AtomicU32::new(0),
        }))
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn location(&self) -> Option<InodeLocation> {
        self.location.lock().clone()
    }

    pub fn set_location(&self, loc: Option<InodeLocation>) {
        *self.location.lock() = loc;
    }

    pub fn mode(&self) -> u32 {
        self.meta.lock().mode
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_mode(self.mode())
    }

    /// Source-control hash if unmaterialized, else `None`
    pub fn source_hash(&self) -> Option<Hash> {
        match &*self.state.lock() {
            FileState::NotLoaded { hash }
            | FileState::Loading { hash, .. }
            | FileState::Loaded { hash, .. } => Some(*hash),
            FileState::Materialized { .. } => None,
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(&*self.state.lock(), FileState::Materialized { .. })
    }

    /// Kernel open-handle accounting
    pub fn handle_opened(&self) {
        self.open_handles
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    pub fn handle_released(&self) {
        self.open_handles
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }

    /// True when nothing pins this inode in memory
    pub fn is_unloadable(&self) -> bool {
        self.open_handles.load(std::sync::atomic::Ordering::Acquire) == 0
            && !matches!(&*self.state.lock(), FileState::Loading { .. })
    }

    /// Ensure content is available: `Some(blob)` for blob-backed state,
    /// `None` once materialized
    async fn ensure_data_ready(&self) -> Result<Option<Bytes>> {
        loop {
            enum Plan {
                Blob(Bytes),
                Overlay,
                Fetch(Hash),
                Wait(oneshot::Receiver<LoadResult>),
            }

            let plan = {
                let mut state = self.state.lock();
                match &mut *state {
                    FileState::Loaded { blob, .. } => Plan::Blob(blob.clone()),
                    FileState::Materialized { .. } => Plan::Overlay,
                    FileState::NotLoaded { hash } => {
                        let hash = *hash;
                        *state = FileState::Loading {
                            hash,
                            waiters: Vec::new(),
                        };
                        Plan::Fetch(hash)
                    }
                    FileState::Loading { waiters, .. } => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Plan::Wait(rx)
                    }
                }
            };

            match plan {
                Plan::Blob(blob) => return Ok(Some(blob)),
                Plan::Overlay => return Ok(None),
                Plan::Fetch(hash) => {
                    let fetched = self.ctx.store.get_blob(hash).await;
                    return self.finish_load(hash, fetched.map(|b| b.bytes.clone()));
                }
                Plan::Wait(rx) => match rx.await {
                    Ok(Ok(blob)) => return Ok(Some(blob)),
                    Ok(Err(msg)) => return Err(Error::LoadFailed(msg)),
                    // The loader was truncated away; re-examine the state.
                    Err(_) => continue,
                },
            }
        }
    }

    fn finish_load(&self, hash: Hash, fetched: Result<Bytes>) -> Result<Option<Bytes>> {
        let mut state = self.state.lock();
        match fetched {
            Ok(blob) => {
                if let FileState::Loading { waiters, .. } = &mut *state {
                    for w in std::mem::take(waiters) {
                        let _ = w.send(Ok(blob.clone()));
                    }
                    *state = FileState::Loaded { hash, blob: blob.clone() };
                    Ok(Some(blob))
                } else {
                    // An O_TRUNC open raced us and already settled the
                    // state; our fetch result is stale.
                    drop(state);
                    Ok(self.loaded_blob())
                }
            }
            Err(e) => {
                let msg = e.to_string();
                if let FileState::Loading { waiters, .. } = &mut *state {
                    for w in std::mem::take(waiters) {
                        let _ = w.send(Err(msg.clone()));
                    }
                    *state = FileState::NotLoaded { hash };
                }
                Err(e)
            }
        }
    }

    fn loaded_blob(&self) -> Option<Bytes> {
        match &*self.state.lock() {
            FileState::Loaded { blob, .. } => Some(blob.clone()),
            _ => None,
        }
    }

    /// Read `len` bytes at `offset`; past-EOF reads return empty
    pub async fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        if let Some(blob) = self.ensure_data_ready().await? {
            let start = (offset as usize).min(blob.len());
            let end = (offset as usize).saturating_add(len).min(blob.len());
            self.meta.lock().timestamps.atime = Timespec::from_system_time(SystemTime::now());
            return Ok(blob.slice(start..end));
        }

        let state = self.state.lock();
        match &*state {
            FileState::Materialized { file, size, .. } => {
                let start = offset.min(*size);
                let end = offset.saturating_add(len as u64).min(*size);
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact_at(&mut buf, HEADER_SIZE as u64 + start)?;
                drop(state);
                self.meta.lock().timestamps.atime =
                    Timespec::from_system_time(SystemTime::now());
                Ok(Bytes::from(buf))
            }
            // Raced with a state change; the blob path covers it now.
            _ => {
                drop(state);
                let blob = self.loaded_blob().unwrap_or_default();
                let start = (offset as usize).min(blob.len());
                let end = (offset as usize).saturating_add(len).min(blob.len());
                Ok(blob.slice(start..end))
            }
        }
    }

    /// Write `data` at `offset`, materializing first if needed
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        self.materialize(false).await?;

        let new_timestamps = {
            let mut state = self.state.lock();
            match &mut *state {
                FileState::Materialized { file, size, sha1 } => {
                    file.write_all_at(data, HEADER_SIZE as u64 + offset)?;
                    *size = (*size).max(offset + data.len() as u64);
                    *sha1 = None;

                    let mut meta = self.meta.lock();
                    meta.timestamps.touch_mtime();
                    let ts = meta.timestamps;
                    drop(meta);
                    self.ctx.overlay.update_file_timestamps(file, ts)?;
                    ts
                }
                _ => {
                    return Err(Error::Internal(format!(
                        "file {} not materialized after write transition",
                        self.ino
                    )))
                }
            }
        };
        self.update_metadata_row(new_timestamps)?;
        Ok(data.len() as u32)
    }

    /// Apply desired attribute changes; truncation to zero shortcuts the load
    pub async fn set_attr(&self, desired: DesiredAttr) -> Result<InodeAttr> {
        if let Some(size) = desired.size {
            if size == 0 {
                // No need to fetch content that is about to be discarded.
                self.materialize(true).await?;
            } else {
                self.materialize(false).await?;
            }
            let mut state = self.state.lock();
            if let FileState::Materialized {
                file,
                size: cur,
                sha1,
            } = &mut *state
            {
                if *cur != size {
                    file.set_len(HEADER_SIZE as u64 + size)?;
                    *cur = size;
                    *sha1 = None;
                }
            }
        }

        let timestamps = {
            let mut meta = self.meta.lock();
            if let Some(mode) = desired.mode {
                // Only permission bits may change; the file type is fixed.
                meta.mode = (meta.mode & libc::S_IFMT as u32) | (mode & !(libc::S_IFMT as u32));
            }
            if let Some(atime) = desired.atime {
                meta.timestamps.atime = Timespec::from_system_time(atime);
            }
            if let Some(mtime) = desired.mtime {
                meta.timestamps.mtime = Timespec::from_system_time(mtime);
            }
            if desired.size.is_some() || desired.mtime.is_some() {
                meta.timestamps.ctime = Timespec::from_system_time(SystemTime::now());
            }
            meta.timestamps
        };

        if self.is_materialized() {
            {
                let state = self.state.lock();
                if let FileState::Materialized { file, .. } = &*state {
                    self.ctx.overlay.update_file_timestamps(file, timestamps)?;
                }
            }
            self.update_metadata_row(timestamps)?;
        }
        self.getattr().await
    }

    /// Symlink target bytes; the content of a symlink is its target
    pub async fn read_link(&self, cache: ReadLinkCache) -> Result<Bytes> {
        if self.kind() != EntryKind::Symlink {
            return Err(Error::NotASymlink(self.ino));
        }
        let target = match self.ensure_data_ready().await? {
            Some(blob) => blob,
            None => self.read(0, usize::MAX).await?,
        };
        if cache == ReadLinkCache::Kernel {
            // The kernel caches the target; drop our copy of the blob.
            let mut state = self.state.lock();
            if let FileState::Loaded { hash, .. } = &*state {
                *state = FileState::NotLoaded { hash: *hash };
            }
        }
        Ok(target)
    }

    /// Content SHA-1, recomputed and cached after writes
    pub async fn get_sha1(&self) -> Result<Sha1Digest> {
        let hash = {
            let mut state = self.state.lock();
            match &mut *state {
                FileState::Materialized { file, size, sha1 } => {
                    if let Some(d) = sha1 {
                        return Ok(*d);
                    }
                    let mut buf = vec![0u8; *size as usize];
                    file.read_exact_at(&mut buf, HEADER_SIZE as u64)?;
                    let digest = content_sha1(&buf);
                    *sha1 = Some(digest);
                    return Ok(digest);
                }
                FileState::NotLoaded { hash }
                | FileState::Loading { hash, .. }
                | FileState::Loaded { hash, .. } => *hash,
            }
        };
        self.ctx.store.get_blob_sha1(hash).await
    }

    /// Fast equality against a source-control entry, used by checkout
    ///
    /// Hash comparison when unmaterialized, then SHA-1 comparison, byte
    /// compare only as the last resort.
    pub async fn is_same_as(&self, entry_hash: Hash, kind: EntryKind) -> Result<bool> {
        if self.kind() != kind {
            return Ok(false);
        }
        if let Some(own) = self.source_hash() {
            if own == entry_hash {
                return Ok(true);
            }
        }
        match (
            self.get_sha1().await,
            self.ctx.store.get_blob_sha1(entry_hash).await,
        ) {
            (Ok(a), Ok(b)) => Ok(a == b),
            _ => {
                debug!("sha1 unavailable for {}; falling back to byte compare", self.ino);
                let theirs = self.ctx.store.get_blob(entry_hash).await?;
                let ours = self.read(0, usize::MAX).await?;
                Ok(ours == theirs.bytes)
            }
        }
    }

    pub async fn getattr(&self) -> Result<InodeAttr> {
        let size = match self.ensure_data_ready().await? {
            Some(blob) => blob.len() as u64,
            None => match &*self.state.lock() {
                FileState::Materialized { size, .. } => *size,
                _ => 0,
            },
        };
        let meta = self.meta.lock();
        Ok(InodeAttr {
            ino: self.ino,
            size,
            mode: meta.mode,
            timestamps: meta.timestamps,
            kind: EntryKind::from_mode(meta.mode),
            nlink: 1,
        })
    }

    /// Force the transition to MATERIALIZED
    ///
    /// With `truncate`, pending loads are cancelled and their waiters see
    /// the truncated (empty) content.
    pub async fn materialize(&self, truncate: bool) -> Result<()> {
        loop {
            enum Plan {
                Done,
                Truncate,
                FromBytes(Bytes),
                NeedLoad,
            }

            let plan = {
                let state = self.state.lock();
                match &*state {
                    FileState::Materialized { .. } => Plan::Done,
                    _ if truncate => Plan::Truncate,
                    FileState::Loaded { blob, .. } => Plan::FromBytes(blob.clone()),
                    FileState::NotLoaded { .. } | FileState::Loading { .. } => Plan::NeedLoad,
                }
            };

            match plan {
                Plan::Done => {
                    if truncate {
                        let mut state = self.state.lock();
                        if let FileState::Materialized { file, size, sha1 } = &mut *state {
                            file.set_len(HEADER_SIZE as u64)?;
                            *size = 0;
                            *sha1 = Some(content_sha1(b""));
                        }
                    }
                    return Ok(());
                }
                Plan::Truncate => {
                    self.switch_to_overlay(&[])?;
                    self.propagate_materialization()?;
                    return Ok(());
                }
                Plan::FromBytes(blob) => {
                    // Re-checked under the lock inside switch_to_overlay.
                    self.switch_to_overlay(&blob)?;
                    self.propagate_materialization()?;
                    return Ok(());
                }
                Plan::NeedLoad => {
                    self.ensure_data_ready().await?;
                }
            }
        }
    }

    /// Create the overlay file and swap the state, settling any waiters
    fn switch_to_overlay(&self, contents: &[u8]) -> Result<()> {
        let timestamps = {
            let mut meta = self.meta.lock();
            meta.timestamps.touch_mtime();
            meta.timestamps
        };
        let file = self.ctx.overlay.create_file(self.ino, timestamps, contents)?;

        let mut state = self.state.lock();
        if let FileState::Loading { waiters, .. } = &mut *state {
            let blob = Bytes::copy_from_slice(contents);
            for w in std::mem::take(waiters) {
                let _ = w.send(Ok(blob.clone()));
            }
        }
        *state = FileState::Materialized {
            file,
            size: contents.len() as u64,
            sha1: Some(content_sha1(contents)),
        };
        drop(state);

        self.update_metadata_row(timestamps)
    }

    fn update_metadata_row(&self, timestamps: InodeTimestamps) -> Result<()> {
        let meta = self.meta.lock();
        self.ctx.overlay.metadata().set(
            self.ino,
            InodeMetadata {
                mode: meta.mode,
                uid: self.ctx.uid,
                gid: self.ctx.gid,
                timestamps,
            },
        )
    }

    /// Materialization propagates to the root through the parent chain
    fn propagate_materialization(&self) -> Result<()> {
        let loc = match self.location() {
            Some(loc) => loc,
            None => return Ok(()),
        };
        let parent = self
            .ctx
            .map
            .get_loaded(loc.parent)
            .ok_or(Error::InodeNotFound(loc.parent))?;
        parent.as_tree()?.child_materialized(&loc.name)
    }
}
