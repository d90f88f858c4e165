//! Directory payload codec
//!
//! A materialized directory's overlay file carries, after the header, a
//! length-prefixed serialization of its entry table. The encoding is
//! deterministic: entries are written in the order given (sorted by name at
//! the call site) and parsed back in the same order.

use crate::error::{Error, Result};
use crate::inode::InodeNumber;
use crate::store::{Hash, HASH_LEN};

/// Lowered form of one directory entry, as persisted
///
/// `hash` is absent iff the entry is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirEntry {
    pub mode: u32,
    pub ino: InodeNumber,
    pub hash: Option<Hash>,
}

/// Lowered directory: (name, entry) pairs in serialization order
pub type OverlayDir = Vec<(String, OverlayDirEntry)>;

/// Serialize an entry table
pub fn serialize_dir(dir: &OverlayDir) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + dir.len() * 48);
    buf.extend_from_slice(&(dir.len() as u32).to_be_bytes());
    for (name, entry) in dir {
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&entry.mode.to_be_bytes());
        buf.extend_from_slice(&entry.ino.get().to_be_bytes());
        match entry.hash {
            Some(h) => {
                buf.push(1);
                buf.extend_from_slice(h.as_bytes());
            }
            None => buf.push(0),
        }
    }
    buf
}

/// Parse an entry table; `ino` is the owning directory, for error context
pub fn parse_dir(ino: InodeNumber, buf: &[u8]) -> Result<OverlayDir> {
    let mut cursor = Cursor { ino, buf, pos: 0 };
    let count = cursor.read_u32()? as usize;
    let mut dir = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = cursor.read_u16()? as usize;
        let name = String::from_utf8(cursor.read_bytes(name_len)?.to_vec())
            .map_err(|_| cursor.corrupt("entry name is not utf-8"))?;
        let mode = cursor.read_u32()?;
        let entry_ino = InodeNumber(cursor.read_u64()?);
        let has_hash = cursor.read_u8()?;
        let hash = match has_hash {
            0 => None,
            1 => {
                let raw: [u8; HASH_LEN] = cursor
                    .read_bytes(HASH_LEN)?
                    .try_into()
                    .expect("read_bytes returned wrong length");
                Some(Hash(raw))
            }
            other => return Err(cursor.corrupt(&format!("bad hash flag {}", other))),
        };
        dir.push((
            name,
            OverlayDirEntry {
                mode,
                ino: entry_ino,
                hash,
            },
        ));
    }
    if cursor.pos != buf.len() {
        return Err(cursor.corrupt("trailing bytes after entry table"));
    }
    Ok(dir)
}

struct Cursor<'a> {
    ino: InodeNumber,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn corrupt(&self, reason: &str) -> Error {
        Error::CorruptOverlay {
            ino: self.ino,
            reason: reason.to_string(),
        }
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(self.corrupt("truncated entry table"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dir() -> OverlayDir {
        vec![
            (
                "a.txt".to_string(),
                OverlayDirEntry {
                    mode: libc::S_IFREG as u32 | 0o644,
                    ino: InodeNumber(12),
                    hash: Some(Hash([3; HASH_LEN])),
                },
            ),
            (
                "sub".to_string(),
                OverlayDirEntry {
                    mode: libc::S_IFDIR as u32 | 0o755,
                    ino: InodeNumber(13),
                    hash: None,
                },
            ),
        ]
    }

    #[test]
    fn test_dir_round_trip() {
        let dir = sample_dir();
        let buf = serialize_dir(&dir);
        let parsed = parse_dir(InodeNumber(5), &buf).unwrap();
        assert_eq!(parsed, dir);
    }

    #[test]
    fn test_dir_serialization_is_deterministic() {
        let dir = sample_dir();
        assert_eq!(serialize_dir(&dir), serialize_dir(&dir));
    }

    #[test]
    fn test_empty_dir() {
        let buf = serialize_dir(&Vec::new());
        assert_eq!(buf, 0u32.to_be_bytes());
        assert!(parse_dir(InodeNumber(5), &buf).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_truncation_and_trailing_garbage() {
        let mut buf = serialize_dir(&sample_dir());

        assert!(matches!(
            parse_dir(InodeNumber(5), &buf[..buf.len() - 3]),
            Err(Error::CorruptOverlay { .. })
        ));

        buf.push(0xff);
        assert!(matches!(
            parse_dir(InodeNumber(5), &buf),
            Err(Error::CorruptOverlay { .. })
        ));
    }
}
