//! Inode metadata table
//!
//! A flat file beside the shard tree mapping inode number to
//! `(mode, uid, gid, timestamps)`. The stat path reads it for materialized
//! inodes whose kernel-visible metadata diverged from the defaults.

use crate::error::{Error, Result};
use crate::inode::{InodeNumber, InodeTimestamps, Timespec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const RECORD_LEN: usize = 8 + 4 + 4 + 4 + 48;

/// Kernel-visible metadata for one materialized inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub timestamps: InodeTimestamps,
}

/// On-disk metadata table with write-through updates
pub struct InodeMetadataTable {
    path: PathBuf,
    entries: Mutex<HashMap<InodeNumber, InodeMetadata>>,
}

impl InodeMetadataTable {
    /// Load the table, or start empty if the file does not exist
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = match fs::read(&path) {
            Ok(buf) => parse_table(&buf)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(InodeMetadataTable {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, ino: InodeNumber) -> Option<InodeMetadata> {
        self.entries.lock().get(&ino).copied()
    }

    pub fn set(&self, ino: InodeNumber, meta: InodeMetadata) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.insert(ino, meta);
            entries.clone()
        };
        self.write_out(&snapshot)
    }

    pub fn remove(&self, ino: InodeNumber) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock();
            if entries.remove(&ino).is_none() {
                return Ok(());
            }
            entries.clone()
        };
        self.write_out(&snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn write_out(&self, entries: &HashMap<InodeNumber, InodeMetadata>) -> Result<()> {
        let mut records: Vec<_> = entries.iter().collect();
        records.sort_by_key(|(ino, _)| **ino);

        let mut buf = Vec::with_capacity(4 + records.len() * RECORD_LEN);
        buf.extend_from_slice(&(records.len() as u32).to_be_bytes());
        for (ino, meta) in records {
            buf.extend_from_slice(&ino.get().to_be_bytes());
            buf.extend_from_slice(&meta.mode.to_be_bytes());
            buf.extend_from_slice(&meta.uid.to_be_bytes());
            buf.extend_from_slice(&meta.gid.to_be_bytes());
            for t in [
                meta.timestamps.atime,
                meta.timestamps.ctime,
                meta.timestamps.mtime,
            ] {
                buf.extend_from_slice(&t.sec.to_be_bytes());
                buf.extend_from_slice(&t.nsec.to_be_bytes());
            }
        }

        let tmp = self.path.with_extension("tmp");
        let result = (|| -> Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&buf)?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

fn parse_table(buf: &[u8]) -> Result<HashMap<InodeNumber, InodeMetadata>> {
    let corrupt = |reason: &str| Error::CorruptOverlay {
        ino: InodeNumber::ROOT,
        reason: format!("metadata table: {}", reason),
    };

    if buf.len() < 4 {
        return Err(corrupt("truncated count"));
    }
    let count = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    if buf.len() != 4 + count * RECORD_LEN {
        return Err(corrupt("length does not match record count"));
    }

    let mut entries = HashMap::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        let rec = &buf[off..off + RECORD_LEN];
        let ino = InodeNumber(u64::from_be_bytes(rec[..8].try_into().unwrap()));
        let mode = u32::from_be_bytes(rec[8..12].try_into().unwrap());
        let uid = u32::from_be_bytes(rec[12..16].try_into().unwrap());
        let gid = u32::from_be_bytes(rec[16..20].try_into().unwrap());
        let mut times = [Timespec::default(); 3];
        let mut t_off = 20;
        for t in &mut times {
            t.sec = u64::from_be_bytes(rec[t_off..t_off + 8].try_into().unwrap());
            t.nsec = u64::from_be_bytes(rec[t_off + 8..t_off + 16].try_into().unwrap());
            t_off += 16;
        }
        entries.insert(
            ino,
            InodeMetadata {
                mode,
                uid,
                gid,
                timestamps: InodeTimestamps {
                    atime: times[0],
                    ctime: times[1],
                    mtime: times[2],
                },
            },
        );
        off += RECORD_LEN;
    }
    Ok(entries)
}
