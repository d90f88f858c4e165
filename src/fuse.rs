//! FUSE adapter
//!
//! Bridges the kernel protocol onto the async mount: each callback spawns
//! onto the tokio runtime and replies from the task. Hard links are not
//! supported and fail with EPERM.

use crate::error::{Error, Result};
use crate::inode::file::{DesiredAttr, ReadLinkCache};
use crate::inode::{Inode, InodeAttr, InodeNumber};
use crate::mount::RevMount;
use crate::store::EntryKind;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

const TTL: Duration = Duration::from_secs(1);

const SHA1_XATTR: &str = "user.sha1";

/// FUSE front-end over a mount
pub struct RevFs {
    mount: Arc<RevMount>,
    runtime: tokio::runtime::Handle,
}

impl RevFs {
    pub fn new(mount: Arc<RevMount>, runtime: tokio::runtime::Handle) -> Self {
        RevFs { mount, runtime }
    }

    /// Mount at the configured mountpoint and serve until unmounted
    pub fn serve(self, mountpoint: &std::path::Path, allow_other: bool) -> Result<()> {
        let mut options = vec![
            fuser::MountOption::FSName("revfs".to_string()),
            fuser::MountOption::DefaultPermissions,
            fuser::MountOption::AutoUnmount,
        ];
        if allow_other {
            options.push(fuser::MountOption::AllowOther);
        }
        fuser::mount2(self, mountpoint, &options)
            .map_err(|e| Error::Internal(format!("fuse mount failed: {}", e)))
    }

    fn attr(&self, attr: &InodeAttr) -> FileAttr {
        let (uid, gid) = self.mount.owner();
        let meta = self
            .mount
            .context()
            .overlay
            .metadata()
            .get(attr.ino);
        FileAttr {
            ino: attr.ino.get(),
            size: attr.size,
            blocks: (attr.size + 511) / 512,
            atime: attr.timestamps.atime.to_system_time(),
            mtime: attr.timestamps.mtime.to_system_time(),
            ctime: attr.timestamps.ctime.to_system_time(),
            crtime: attr.timestamps.ctime.to_system_time(),
            kind: kind_to_fuse(attr.kind),
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: meta.map(|m| m.uid).unwrap_or(uid),
            gid: meta.map(|m| m.gid).unwrap_or(gid),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn kind_to_fuse(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Tree => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::RegularFile | EntryKind::ExecutableFile => FileType::RegularFile,
    }
}

fn name_str(name: &OsStr) -> std::result::Result<String, i32> {
    name.to_str()
        .map(|s| s.to_string())
        .ok_or(libc::EINVAL)
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

macro_rules! spawn_reply {
    ($self:ident, $reply:ident, $body:expr) => {{
        let fs = RevFs {
            mount: Arc::clone(&$self.mount),
            runtime: $self.runtime.clone(),
        };
        $self.runtime.spawn(async move { ($body)(fs, $reply).await });
    }};
}

impl Filesystem for RevFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyEntry| async move {
            let result: Result<(FileAttr, u64)> = async {
                let ctx = fs.mount.context();
                let parent_inode = ctx.lookup_inode(InodeNumber(parent)).await?;
                let child = parent_inode.as_tree()?.get_or_load_child(&name).await?;
                let attr = child.getattr().await?;
                ctx.map.inc_lookup(child.ino(), 1);
                Ok((fs.attr(&attr), fs.mount.generation()))
            }
            .await;
            match result {
                Ok((attr, generation)) => reply.entry(&TTL, &attr, generation),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.mount.context().map.forget(InodeNumber(ino), nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyAttr| async move {
            let result: Result<FileAttr> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                Ok(fs.attr(&inode.getattr().await?))
            }
            .await;
            match result {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let desired = DesiredAttr {
            mode,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyAttr| async move {
            let result: Result<FileAttr> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                match inode {
                    Inode::File(f) => Ok(fs.attr(&f.set_attr(desired).await?)),
                    // Directories only take timestamp/mode updates, which
                    // the next getattr reflects from the metadata table.
                    Inode::Tree(t) => Ok(fs.attr(&t.getattr())),
                }
            }
            .await;
            match result {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyData| async move {
            let result: Result<bytes::Bytes> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                inode.as_file()?.read_link(ReadLinkCache::Kernel).await
            }
            .await;
            match result {
                Ok(target) => reply.data(&target),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);
        if mode & libc::S_IFMT as u32 != libc::S_IFREG as u32 {
            return reply.error(libc::EOPNOTSUPP);
        }
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyEntry| async move {
            let result: Result<(FileAttr, u64)> = async {
                let ctx = fs.mount.context();
                let parent_inode = ctx.lookup_inode(InodeNumber(parent)).await?;
                let child = parent_inode.as_tree()?.create(&name, mode, b"").await?;
                let attr = child.getattr().await?;
                ctx.map.inc_lookup(child.ino(), 1);
                Ok((fs.attr(&attr), fs.mount.generation()))
            }
            .await;
            match result {
                Ok((attr, generation)) => reply.entry(&TTL, &attr, generation),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        let mode = libc::S_IFDIR as u32 | (mode & 0o7777);
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyEntry| async move {
            let result: Result<(FileAttr, u64)> = async {
                let ctx = fs.mount.context();
                let parent_inode = ctx.lookup_inode(InodeNumber(parent)).await?;
                let child = parent_inode.as_tree()?.mkdir(&name, mode).await?;
                let attr = child.getattr().await?;
                ctx.map.inc_lookup(child.ino(), 1);
                Ok((fs.attr(&attr), fs.mount.generation()))
            }
            .await;
            match result {
                Ok((attr, generation)) => reply.entry(&TTL, &attr, generation),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyEmpty| async move {
            let result: Result<()> = async {
                let parent_inode = fs.mount.context().lookup_inode(InodeNumber(parent)).await?;
                parent_inode.as_tree()?.unlink(&name).await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyEmpty| async move {
            let result: Result<()> = async {
                let parent_inode = fs.mount.context().lookup_inode(InodeNumber(parent)).await?;
                parent_inode.as_tree()?.rmdir(&name).await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?} -> {:?})", parent, link_name, target);
        let name = match name_str(link_name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        let target = target.to_string_lossy().to_string();
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyEntry| async move {
            let result: Result<(FileAttr, u64)> = async {
                let ctx = fs.mount.context();
                let parent_inode = ctx.lookup_inode(InodeNumber(parent)).await?;
                let child = parent_inode.as_tree()?.symlink(&name, &target).await?;
                let attr = child.getattr().await?;
                ctx.map.inc_lookup(child.ino(), 1);
                Ok((fs.attr(&attr), fs.mount.generation()))
            }
            .await;
            match result {
                Ok((attr, generation)) => reply.entry(&TTL, &attr, generation),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename({}/{:?} -> {}/{:?})",
            parent, name, newparent, newname
        );
        let (name, newname) = match (name_str(name), name_str(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyEmpty| async move {
            let result: Result<()> = async {
                let ctx = fs.mount.context();
                let src = ctx.lookup_inode(InodeNumber(parent)).await?;
                let dst = ctx.lookup_inode(InodeNumber(newparent)).await?;
                let src = src.as_tree()?;
                let dst = dst.as_tree()?;
                src.rename(&name, dst, &newname).await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // Hard links are unsupported by design.
        reply.error(Error::HardLinksUnsupported.errno());
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyOpen| async move {
            let result: Result<u64> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                let file = inode.as_file()?;
                if flags & libc::O_TRUNC != 0 {
                    file.materialize(true).await?;
                }
                file.handle_opened();
                Ok(ino)
            }
            .await;
            match result {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, offset={}, size={})", ino, offset, size);
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyData| async move {
            let result: Result<bytes::Bytes> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                inode.as_file()?.read(offset as u64, size as usize).await
            }
            .await;
            match result {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, offset={}, len={})", ino, offset, data.len());
        let data = data.to_vec();
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyWrite| async move {
            let result: Result<u32> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                inode.as_file()?.write(offset as u64, &data).await
            }
            .await;
            match result {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Writes land in the overlay synchronously; nothing to flush.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(Inode::File(f)) = self.mount.context().map.get_loaded(InodeNumber(ino)) {
            f.handle_released();
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        // The overlay deliberately trades fsync for throughput.
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyOpen| async move {
            let result: Result<()> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                let tree = inode.as_tree()?.clone();
                // Warm the directory's blobs if the prefetch budget allows.
                if let Some(lease) = fs.mount.try_start_tree_prefetch() {
                    let mount = Arc::clone(&fs.mount);
                    tokio::spawn(async move {
                        mount.prefetch_tree(&tree, lease).await;
                    });
                }
                Ok(())
            }
            .await;
            match result {
                Ok(()) => reply.opened(0, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        spawn_reply!(self, reply, move |fs: RevFs, mut reply: ReplyDirectory| async move {
            let result: Result<Vec<(u64, FileType, String)>> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                let tree = inode.as_tree()?;
                let parent = tree.location().map(|l| l.parent.get()).unwrap_or(ino);
                let mut rows = vec![
                    (ino, FileType::Directory, ".".to_string()),
                    (parent, FileType::Directory, "..".to_string()),
                ];
                for e in tree.readdir(0) {
                    rows.push((e.ino.get(), kind_to_fuse(e.kind), e.name));
                }
                Ok(rows)
            }
            .await;
            match result {
                Ok(rows) => {
                    for (i, (entry_ino, ft, name)) in
                        rows.iter().enumerate().skip(offset as usize)
                    {
                        if reply.add(*entry_ino, (i + 1) as i64, *ft, name) {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        let mode = libc::S_IFREG as u32 | (mode & 0o7777);
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyCreate| async move {
            let result: Result<(FileAttr, u64, u64)> = async {
                let ctx = fs.mount.context();
                let parent_inode = ctx.lookup_inode(InodeNumber(parent)).await?;
                let child = parent_inode.as_tree()?.create(&name, mode, b"").await?;
                let file = child.as_file()?;
                file.handle_opened();
                let attr = child.getattr().await?;
                ctx.map.inc_lookup(child.ino(), 1);
                Ok((fs.attr(&attr), fs.mount.generation(), child.ino().get()))
            }
            .await;
            match result {
                Ok((attr, generation, fh)) => reply.created(&TTL, &attr, generation, fh, flags as u32),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        if name.to_str() != Some(SHA1_XATTR) {
            return reply.error(libc::ENODATA);
        }
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyXattr| async move {
            let result: Result<String> = async {
                let inode = fs.mount.context().lookup_inode(InodeNumber(ino)).await?;
                let file = inode.as_file()?;
                if file.kind() == EntryKind::Symlink {
                    return Err(Error::NoEntry(SHA1_XATTR.to_string()));
                }
                Ok(hex::encode(file.get_sha1().await?))
            }
            .await;
            match result {
                Ok(digest) => {
                    let bytes = digest.as_bytes();
                    if size == 0 {
                        reply.size(bytes.len() as u32);
                    } else if size as usize >= bytes.len() {
                        reply.data(bytes);
                    } else {
                        reply.error(libc::ERANGE);
                    }
                }
                Err(e) => match e {
                    Error::NoEntry(_) | Error::IsADirectory(_) => reply.error(libc::ENODATA),
                    e => reply.error(e.errno()),
                },
            }
        });
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        spawn_reply!(self, reply, move |fs: RevFs, reply: ReplyXattr| async move {
            let names: &[u8] = match fs.mount.context().lookup_inode(InodeNumber(ino)).await {
                Ok(Inode::File(f)) if f.kind() != EntryKind::Symlink => b"user.sha1\0",
                Ok(_) => b"",
                Err(e) => return reply.error(e.errno()),
            };
            if size == 0 {
                reply.size(names.len() as u32);
            } else if size as usize >= names.len() {
                reply.data(names);
            } else {
                reply.error(libc::ERANGE);
            }
        });
    }
}
