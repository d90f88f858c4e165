//! Overlay on-disk headers
//!
//! Bit-exact formats: the info file is a 4-byte magic plus a big-endian
//! version; every inode file starts with a 64-byte header carrying the
//! identifier, version, and a-/c-/m-times.

use crate::error::{Error, Result};
use crate::inode::{InodeNumber, InodeTimestamps, Timespec};

/// Magic prefix of the overlay info file
pub const INFO_MAGIC: [u8; 4] = [0xED, 0xE0, 0x00, 0x01];

/// Current overlay format version
pub const FORMAT_VERSION: u32 = 1;

/// Identifier for directory inode files
pub const ID_DIR: [u8; 4] = *b"OVDR";

/// Identifier for file inode files
pub const ID_FILE: [u8; 4] = *b"OVFL";

/// Fixed size of every inode file header
pub const HEADER_SIZE: usize = 64;

/// Serialized info file contents
pub fn serialize_info(version: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&INFO_MAGIC);
    buf[4..].copy_from_slice(&version.to_be_bytes());
    buf
}

/// Parse and validate the info file, returning the format version
pub fn parse_info(buf: &[u8]) -> Result<u32> {
    if buf.len() < 8 {
        return Err(corrupt_info("truncated info file"));
    }
    if buf[..4] != INFO_MAGIC {
        return Err(corrupt_info("bad info file magic"));
    }
    let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    Ok(version)
}

fn corrupt_info(reason: &str) -> Error {
    Error::CorruptOverlay {
        ino: InodeNumber::ROOT,
        reason: reason.to_string(),
    }
}

/// Build the 64-byte inode file header
pub fn serialize_header(id: [u8; 4], version: u32, ts: InodeTimestamps) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    buf[..4].copy_from_slice(&id);
    buf[4..8].copy_from_slice(&version.to_be_bytes());
    let mut off = 8;
    for t in [ts.atime, ts.ctime, ts.mtime] {
        buf[off..off + 8].copy_from_slice(&t.sec.to_be_bytes());
        buf[off + 8..off + 16].copy_from_slice(&t.nsec.to_be_bytes());
        off += 16;
    }
    // Remaining bytes stay zero padding.
    buf
}

/// Parse a 64-byte inode file header
pub fn parse_header(ino: InodeNumber, buf: &[u8]) -> Result<([u8; 4], u32, InodeTimestamps)> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::CorruptOverlay {
            ino,
            reason: format!("truncated header: {} bytes", buf.len()),
        });
    }
    let id: [u8; 4] = buf[..4].try_into().unwrap();
    if id != ID_DIR && id != ID_FILE {
        return Err(Error::CorruptOverlay {
            ino,
            reason: format!("unknown header identifier {:02x?}", &buf[..4]),
        });
    }
    let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::CorruptOverlay {
            ino,
            reason: format!("unsupported header version {}", version),
        });
    }

    let mut times = [Timespec::default(); 3];
    let mut off = 8;
    for t in &mut times {
        t.sec = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        t.nsec = u64::from_be_bytes(buf[off + 8..off + 16].try_into().unwrap());
        off += 16;
    }

    Ok((
        id,
        version,
        InodeTimestamps {
            atime: times[0],
            ctime: times[1],
            mtime: times[2],
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_timestamps() -> InodeTimestamps {
        InodeTimestamps {
            atime: Timespec { sec: 1000, nsec: 1 },
            ctime: Timespec { sec: 2000, nsec: 2 },
            mtime: Timespec { sec: 3000, nsec: 3 },
        }
    }

    #[test]
    fn test_header_round_trip() {
        let ts = sample_timestamps();
        for id in [ID_DIR, ID_FILE] {
            let buf = serialize_header(id, FORMAT_VERSION, ts);
            let (got_id, got_version, got_ts) = parse_header(InodeNumber(7), &buf).unwrap();
            assert_eq!(got_id, id);
            assert_eq!(got_version, FORMAT_VERSION);
            assert_eq!(got_ts, ts);
        }
    }

    #[test]
    fn test_header_layout_is_bit_exact() {
        let buf = serialize_header(ID_FILE, 1, sample_timestamps());
        assert_eq!(&buf[..4], b"OVFL");
        assert_eq!(&buf[4..8], &1u32.to_be_bytes());
        assert_eq!(&buf[8..16], &1000u64.to_be_bytes());
        assert_eq!(&buf[16..24], &1u64.to_be_bytes());
        // Padding after the three timestamp pairs is all zero.
        assert!(buf[56..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_rejects_corruption() {
        let ts = sample_timestamps();
        let mut buf = serialize_header(ID_DIR, FORMAT_VERSION, ts).to_vec();

        assert!(parse_header(InodeNumber(7), &buf[..10]).is_err());

        buf[0] = b'X';
        assert!(matches!(
            parse_header(InodeNumber(7), &buf),
            Err(Error::CorruptOverlay { .. })
        ));
    }

    #[test]
    fn test_info_round_trip() {
        let buf = serialize_info(FORMAT_VERSION);
        assert_eq!(buf[..4], [0xed, 0xe0, 0x00, 0x01]);
        assert_eq!(parse_info(&buf).unwrap(), FORMAT_VERSION);
        assert!(parse_info(&buf[..3]).is_err());
        assert!(parse_info(b"ABCD0000").is_err());
    }
}
