//! On-disk overlay store
//!
//! Persists directory listings and file contents for materialized inodes,
//! allocates inode numbers, and scan-recovers the allocator after an
//! unclean shutdown. Writes go to a sibling temp file and rename over the
//! target; the overlay deliberately never calls fdatasync, trading crash
//! durability for throughput.
//!
//! Layout under the overlay root:
//!   - `info`: magic + format version, advisory-locked for the overlay's
//!     lifetime
//!   - `next-inode`: allocator watermark, written on clean close only
//!   - `metadata`: the inode metadata table
//!   - `00`..`ff`: shard directories; inode N lives at
//!     `<shard of low 8 bits>/<N in decimal>`

mod dir;
mod header;
mod metadata;

pub use dir::{OverlayDir, OverlayDirEntry};
pub use header::{FORMAT_VERSION, HEADER_SIZE, ID_DIR, ID_FILE, INFO_MAGIC};
pub use metadata::{InodeMetadata, InodeMetadataTable};

use crate::error::{Error, Result};
use crate::inode::{InodeNumber, InodeTimestamps};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{IoSlice, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

const INFO_FILE: &str = "info";
const NEXT_INODE_FILE: &str = "next-inode";
const METADATA_FILE: &str = "metadata";

/// Paths and tables shared with the removal worker
struct Shared {
    root: PathBuf,
    metadata: InodeMetadataTable,
}

impl Shared {
    fn path_for(&self, ino: InodeNumber) -> PathBuf {
        self.root
            .join(format!("{:02x}", ino.shard()))
            .join(ino.get().to_string())
    }

    fn tmp_path_for(&self, ino: InodeNumber) -> PathBuf {
        self.root
            .join(format!("{:02x}", ino.shard()))
            .join(format!("{}.tmp", ino.get()))
    }

    fn remove(&self, ino: InodeNumber) -> Result<()> {
        match fs::remove_file(self.path_for(ino)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.metadata.remove(ino)
    }

    fn read_inode_file(&self, ino: InodeNumber) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(ino)) {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load_dir(&self, ino: InodeNumber) -> Result<Option<(OverlayDir, InodeTimestamps)>> {
        let buf = match self.read_inode_file(ino)? {
            Some(buf) => buf,
            None => return Ok(None),
        };
        let (id, _version, ts) = header::parse_header(ino, &buf)?;
        if id != header::ID_DIR {
            return Err(Error::CorruptOverlay {
                ino,
                reason: "expected a directory, found a file".to_string(),
            });
        }
        let entries = dir::parse_dir(ino, &buf[HEADER_SIZE..])?;
        Ok(Some((entries, ts)))
    }

    /// Remove `ino` and every materialized descendant, breadth-first
    fn remove_subtree(&self, ino: InodeNumber) {
        let mut queue = vec![ino];
        while let Some(next) = queue.pop() {
            match self.load_dir(next) {
                Ok(Some((entries, _))) => {
                    for (_, entry) in entries {
                        let is_dir =
                            entry.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32;
                        if is_dir && entry.hash.is_none() {
                            queue.push(entry.ino);
                        } else if let Err(e) = self.remove(entry.ino) {
                            warn!("failed to remove overlay data for {}: {}", entry.ino, e);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable overlay dir {}: {}", next, e),
            }
            if let Err(e) = self.remove(next) {
                warn!("failed to remove overlay data for {}: {}", next, e);
            }
        }
    }
}

/// The per-mount overlay store
///
/// Concurrent operations on distinct inode numbers are safe; at-most-one
/// writer per inode is the caller's (the inode's own lock) responsibility.
pub struct Overlay {
    shared: Arc<Shared>,
    next_inode: AtomicU64,
    /// Holds the advisory lock for the overlay's lifetime
    info_file: Mutex<Option<File>>,
    remove_tx: Mutex<Option<mpsc::Sender<InodeNumber>>>,
    remove_worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Overlay {
    /// Open or create an overlay rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let info_path = root.join(INFO_FILE);

        if !info_path.exists() {
            Self::initialize_root(&root)?;
        }

        let info_file = OpenOptions::new().read(true).open(&info_path)?;
        let mut info_buf = Vec::new();
        (&info_file).read_to_end(&mut info_buf)?;
        let version = header::parse_info(&info_buf)?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedOverlayVersion(version));
        }

        // Single-writer: hold an advisory lock for the overlay's lifetime.
        let rc = unsafe { libc::flock(info_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::OverlayLocked(root.display().to_string()));
        }

        let metadata = InodeMetadataTable::open(root.join(METADATA_FILE))?;
        let shared = Arc::new(Shared { root, metadata });

        let next = match Self::take_persisted_next_inode(&shared.root)? {
            Some(n) => n,
            None => {
                debug!("no clean allocator watermark; scanning overlay");
                scan_for_next_inode(&shared)?
            }
        };

        Ok(Overlay {
            shared,
            next_inode: AtomicU64::new(next.max(InodeNumber::ROOT.get() + 1)),
            info_file: Mutex::new(Some(info_file)),
            remove_tx: Mutex::new(None),
            remove_worker: Mutex::new(None),
        })
    }

    fn initialize_root(root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        for shard in 0..=0xffu32 {
            fs::create_dir_all(root.join(format!("{:02x}", shard)))?;
        }
        let mut f = File::create(root.join(INFO_FILE))?;
        f.write_all(&header::serialize_info(FORMAT_VERSION))?;
        Ok(())
    }

    /// Read and delete the clean-shutdown watermark, if present
    ///
    /// Deleting it up front means a crash before close forces the scan on
    /// the next open instead of trusting a stale value.
    fn take_persisted_next_inode(root: &Path) -> Result<Option<u64>> {
        let path = root.join(NEXT_INODE_FILE);
        match fs::read(&path) {
            Ok(buf) if buf.len() == 8 => {
                fs::remove_file(&path)?;
                Ok(Some(u64::from_be_bytes(buf.try_into().unwrap())))
            }
            Ok(_) => {
                fs::remove_file(&path)?;
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Next monotonically-increasing inode number
    pub fn allocate_inode_number(&self) -> InodeNumber {
        InodeNumber(self.next_inode.fetch_add(1, Ordering::AcqRel))
    }

    /// The value the next allocation would return
    pub fn next_inode_number(&self) -> InodeNumber {
        InodeNumber(self.next_inode.load(Ordering::Acquire))
    }

    /// Seed the allocator to at least `next` (takeover restore)
    pub fn ensure_next_inode_at_least(&self, next: u64) {
        self.next_inode.fetch_max(next, Ordering::AcqRel);
    }

    pub fn metadata(&self) -> &InodeMetadataTable {
        &self.shared.metadata
    }

    /// Shard-relative path of an inode's overlay file
    pub fn path_for(&self, ino: InodeNumber) -> PathBuf {
        self.shared.path_for(ino)
    }

    /// Cheap existence check for overlay data
    pub fn has_data(&self, ino: InodeNumber) -> bool {
        fs::symlink_metadata(self.shared.path_for(ino)).is_ok()
    }

    /// Atomically persist a directory's entry table
    pub fn save_dir(
        &self,
        ino: InodeNumber,
        entries: &OverlayDir,
        ts: InodeTimestamps,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + entries.len() * 48);
        buf.extend_from_slice(&header::serialize_header(ID_DIR, FORMAT_VERSION, ts));
        buf.extend_from_slice(&dir::serialize_dir(entries));
        self.write_inode_file(ino, |f| f.write_all(&buf).map_err(Into::into))?;
        Ok(())
    }

    /// Load a directory's entry table; `None` if no overlay data exists
    pub fn load_dir(&self, ino: InodeNumber) -> Result<Option<(OverlayDir, InodeTimestamps)>> {
        self.shared.load_dir(ino)
    }

    /// Materialize a file with the given initial contents
    ///
    /// Returns an open read-write descriptor on the final file; offsets on
    /// the descriptor include the header.
    pub fn create_file(
        &self,
        ino: InodeNumber,
        ts: InodeTimestamps,
        contents: &[u8],
    ) -> Result<File> {
        self.create_file_from_slices(ino, ts, &[IoSlice::new(contents)])
    }

    /// Materialize a file from an io-vector of slices
    pub fn create_file_from_slices(
        &self,
        ino: InodeNumber,
        ts: InodeTimestamps,
        slices: &[IoSlice<'_>],
    ) -> Result<File> {
        self.write_inode_file(ino, |f| {
            let header = header::serialize_header(ID_FILE, FORMAT_VERSION, ts);
            f.write_all(&header)?;
            for s in slices {
                f.write_all(s)?;
            }
            Ok(())
        })
    }

    /// Open an existing materialized file, validating its header
    pub fn open_file(&self, ino: InodeNumber) -> Result<(File, InodeTimestamps)> {
        let path = self.shared.path_for(ino);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::CorruptOverlay {
                        ino,
                        reason: "materialized file has no overlay data".to_string(),
                    }
                } else {
                    Error::Io(e)
                }
            })?;
        let mut head = [0u8; HEADER_SIZE];
        read_exact_at(&file, &mut head, 0, ino)?;
        let (id, _version, ts) = header::parse_header(ino, &head)?;
        if id != header::ID_FILE {
            return Err(Error::CorruptOverlay {
                ino,
                reason: "expected a file, found a directory".to_string(),
            });
        }
        Ok((file, ts))
    }

    /// Read a materialized file's full contents, without the header
    pub fn load_file_contents(
        &self,
        ino: InodeNumber,
    ) -> Result<Option<(Vec<u8>, InodeTimestamps)>> {
        let buf = match self.shared.read_inode_file(ino)? {
            Some(buf) => buf,
            None => return Ok(None),
        };
        let (id, _version, ts) = header::parse_header(ino, &buf)?;
        if id != header::ID_FILE {
            return Err(Error::CorruptOverlay {
                ino,
                reason: "expected a file, found a directory".to_string(),
            });
        }
        Ok(Some((buf[HEADER_SIZE..].to_vec(), ts)))
    }

    /// Rewrite the timestamp region of an open materialized file's header
    pub fn update_file_timestamps(
        &self,
        file: &File,
        ts: InodeTimestamps,
    ) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let header = header::serialize_header(ID_FILE, FORMAT_VERSION, ts);
        file.write_all_at(&header, 0)?;
        Ok(())
    }

    /// Unlink an inode's overlay data; missing is not an error
    pub fn remove(&self, ino: InodeNumber) -> Result<()> {
        self.shared.remove(ino)
    }

    /// Queue removal of `ino` and its materialized subtree
    ///
    /// Safe because removed inode numbers cannot be in use: the parent
    /// already dropped the entry. Work happens on a background thread.
    pub fn recursively_remove(&self, ino: InodeNumber) {
        let mut tx_guard = self.remove_tx.lock();
        if tx_guard.is_none() {
            let (tx, rx) = mpsc::channel::<InodeNumber>();
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("overlay-gc".to_string())
                .spawn(move || {
                    for ino in rx {
                        shared.remove_subtree(ino);
                    }
                })
                .expect("failed to spawn overlay gc thread");
            *tx_guard = Some(tx);
            *self.remove_worker.lock() = Some(handle);
        }
        // The worker only exits once the sender is dropped at close.
        let _ = tx_guard.as_ref().unwrap().send(ino);
    }

    /// Clean shutdown: drain the removal worker, persist the allocator
    /// watermark, and release the advisory lock
    pub fn close(&self) -> Result<()> {
        if let Some(tx) = self.remove_tx.lock().take() {
            drop(tx);
        }
        if let Some(worker) = self.remove_worker.lock().take() {
            let _ = worker.join();
        }

        let next = self.next_inode.load(Ordering::Acquire);
        let path = self.shared.root.join(NEXT_INODE_FILE);
        fs::write(&path, next.to_be_bytes())?;

        drop(self.info_file.lock().take());
        Ok(())
    }

    /// Temp-write-then-rename; the temp file is unlinked on failure
    fn write_inode_file<W>(&self, ino: InodeNumber, write: W) -> Result<File>
    where
        W: FnOnce(&mut File) -> Result<()>,
    {
        let tmp = self.shared.tmp_path_for(ino);
        let target = self.shared.path_for(ino);
        let result = (|| -> Result<File> {
            // Creating with truncate also clears any stale temp file left
            // by a crash between write and rename.
            let mut f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&tmp)?;
            write(&mut f)?;
            fs::rename(&tmp, &target)?;
            Ok(f)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        // An overlay dropped without close() leaves no watermark, which
        // forces the scan on the next open.
        if let Some(tx) = self.remove_tx.lock().take() {
            drop(tx);
        }
        if let Some(worker) = self.remove_worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// Allocator recovery: the maximum inode number referenced anywhere in the
/// overlay, plus one
fn scan_for_next_inode(shared: &Shared) -> Result<u64> {
    let mut max_seen = InodeNumber::ROOT.get();

    // Walk every reachable directory from the root down.
    let mut queue = vec![InodeNumber::ROOT];
    while let Some(ino) = queue.pop() {
        let entries = match shared.load_dir(ino) {
            Ok(Some((entries, _))) => entries,
            Ok(None) => continue,
            Err(e) => {
                warn!("allocator scan skipping corrupt dir {}: {}", ino, e);
                continue;
            }
        };
        for (_, entry) in entries {
            max_seen = max_seen.max(entry.ino.get());
            let is_dir = entry.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32;
            if is_dir && entry.hash.is_none() {
                queue.push(entry.ino);
            }
        }
    }

    // Orphaned files (e.g. after a crash mid-unlink) still pin their
    // numbers: scan the shards for numeric filenames.
    for shard in 0..=0xffu32 {
        let shard_dir = shared.root.join(format!("{:02x}", shard));
        let reader = match fs::read_dir(&shard_dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for dirent in reader {
            let dirent = dirent?;
            if let Some(n) = dirent
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u64>().ok())
            {
                max_seen = max_seen.max(n);
            }
        }
    }

    debug!("allocator scan found max inode {}", max_seen);
    Ok(max_seen + 1)
}

fn read_exact_at(file: &File, buf: &mut [u8], offset: u64, ino: InodeNumber) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::CorruptOverlay {
                ino,
                reason: "truncated header".to_string(),
            }
        } else {
            Error::Io(e)
        }
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::Timespec;
    use tempfile::tempdir;

    fn ts(a: u64, c: u64, m: u64) -> InodeTimestamps {
        InodeTimestamps {
            atime: Timespec { sec: a, nsec: 0 },
            ctime: Timespec { sec: c, nsec: 0 },
            mtime: Timespec { sec: m, nsec: 0 },
        }
    }

    #[test]
    fn test_file_round_trip_across_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("o");

        let overlay = Overlay::open(&root).unwrap();
        overlay
            .create_file(InodeNumber(100), ts(1000, 2000, 3000), b"hello")
            .unwrap();
        // Low byte of 100 is 0x64.
        assert!(root.join("64").join("100").exists());
        overlay.close().unwrap();
        drop(overlay);

        let overlay = Overlay::open(&root).unwrap();
        let (bytes, got_ts) = overlay
            .load_file_contents(InodeNumber(100))
            .unwrap()
            .unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(got_ts, ts(1000, 2000, 3000));
    }

    #[test]
    fn test_allocator_scan_recovery() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("o");

        {
            let overlay = Overlay::open(&root).unwrap();
            for ino in [1u64, 2, 7] {
                overlay
                    .create_file(InodeNumber(ino), ts(0, 0, 0), b"x")
                    .unwrap();
            }
            // Dropped without close: no watermark is persisted.
        }

        let overlay = Overlay::open(&root).unwrap();
        assert_eq!(overlay.allocate_inode_number(), InodeNumber(8));
    }

    #[test]
    fn test_allocator_monotonic_and_persisted_on_close() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("o");

        let overlay = Overlay::open(&root).unwrap();
        let a = overlay.allocate_inode_number();
        let b = overlay.allocate_inode_number();
        assert!(b > a);
        overlay.close().unwrap();
        drop(overlay);

        let overlay = Overlay::open(&root).unwrap();
        let c = overlay.allocate_inode_number();
        assert!(c > b);
    }

    #[test]
    fn test_allocator_scan_sees_dir_entries() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("o");

        {
            let overlay = Overlay::open(&root).unwrap();
            // Root dir references inode 42, which itself has no overlay
            // data (an unmaterialized child with an allocated number).
            let entries = vec![(
                "child".to_string(),
                OverlayDirEntry {
                    mode: libc::S_IFREG as u32 | 0o644,
                    ino: InodeNumber(42),
                    hash: Some(crate::store::Hash([1; 20])),
                },
            )];
            overlay
                .save_dir(InodeNumber::ROOT, &entries, ts(0, 0, 0))
                .unwrap();
        }

        let overlay = Overlay::open(&root).unwrap();
        assert_eq!(overlay.allocate_inode_number(), InodeNumber(43));
    }

    #[test]
    fn test_dir_round_trip() {
        let dir = tempdir().unwrap();
        let overlay = Overlay::open(dir.path().join("o")).unwrap();

        let entries = vec![
            (
                "a".to_string(),
                OverlayDirEntry {
                    mode: libc::S_IFREG as u32 | 0o644,
                    ino: InodeNumber(10),
                    hash: Some(crate::store::Hash([7; 20])),
                },
            ),
            (
                "b".to_string(),
                OverlayDirEntry {
                    mode: libc::S_IFDIR as u32 | 0o755,
                    ino: InodeNumber(11),
                    hash: None,
                },
            ),
        ];
        overlay
            .save_dir(InodeNumber(5), &entries, ts(9, 9, 9))
            .unwrap();

        let (loaded, got_ts) = overlay.load_dir(InodeNumber(5)).unwrap().unwrap();
        assert_eq!(loaded, entries);
        assert_eq!(got_ts, ts(9, 9, 9));

        assert!(overlay.load_dir(InodeNumber(999)).unwrap().is_none());
    }

    #[test]
    fn test_load_dir_rejects_file_data() {
        let dir = tempdir().unwrap();
        let overlay = Overlay::open(dir.path().join("o")).unwrap();
        overlay
            .create_file(InodeNumber(3), ts(0, 0, 0), b"contents")
            .unwrap();
        assert!(matches!(
            overlay.load_dir(InodeNumber(3)),
            Err(Error::CorruptOverlay { .. })
        ));
    }

    #[test]
    fn test_corrupt_header_is_an_error() {
        let dir = tempdir().unwrap();
        let overlay = Overlay::open(dir.path().join("o")).unwrap();
        fs::write(overlay.path_for(InodeNumber(6)), b"garbage").unwrap();
        assert!(matches!(
            overlay.load_file_contents(InodeNumber(6)),
            Err(Error::CorruptOverlay { .. })
        ));
    }

    #[test]
    fn test_remove_and_has_data() {
        let dir = tempdir().unwrap();
        let overlay = Overlay::open(dir.path().join("o")).unwrap();

        overlay
            .create_file(InodeNumber(20), ts(0, 0, 0), b"x")
            .unwrap();
        assert!(overlay.has_data(InodeNumber(20)));

        overlay.remove(InodeNumber(20)).unwrap();
        assert!(!overlay.has_data(InodeNumber(20)));
        // Missing is not an error.
        overlay.remove(InodeNumber(20)).unwrap();
    }

    #[test]
    fn test_recursive_remove_clears_subtree() {
        let dir = tempdir().unwrap();
        let overlay = Overlay::open(dir.path().join("o")).unwrap();

        // dir 10 -> { file 11, dir 12 -> { file 13 } }
        overlay
            .create_file(InodeNumber(11), ts(0, 0, 0), b"a")
            .unwrap();
        overlay
            .create_file(InodeNumber(13), ts(0, 0, 0), b"b")
            .unwrap();
        overlay
            .save_dir(
                InodeNumber(12),
                &vec![(
                    "f".to_string(),
                    OverlayDirEntry {
                        mode: libc::S_IFREG as u32 | 0o644,
                        ino: InodeNumber(13),
                        hash: None,
                    },
                )],
                ts(0, 0, 0),
            )
            .unwrap();
        overlay
            .save_dir(
                InodeNumber(10),
                &vec![
                    (
                        "f".to_string(),
                        OverlayDirEntry {
                            mode: libc::S_IFREG as u32 | 0o644,
                            ino: InodeNumber(11),
                            hash: None,
                        },
                    ),
                    (
                        "d".to_string(),
                        OverlayDirEntry {
                            mode: libc::S_IFDIR as u32 | 0o755,
                            ino: InodeNumber(12),
                            hash: None,
                        },
                    ),
                ],
                ts(0, 0, 0),
            )
            .unwrap();

        overlay.recursively_remove(InodeNumber(10));
        overlay.close().unwrap();

        for ino in [10u64, 11, 12, 13] {
            assert!(!overlay.has_data(InodeNumber(ino)), "inode {} remains", ino);
        }
    }

    #[test]
    fn test_second_open_fails_while_locked() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("o");
        let _overlay = Overlay::open(&root).unwrap();
        assert!(matches!(
            Overlay::open(&root),
            Err(Error::OverlayLocked(_))
        ));
    }
}
