//! Wire frame format
//!
//! Layout (little-endian):
//! ┌─────────────────────────────────────────────────────┐
//! │ FrameHeader (28 bytes, fixed)                       │
//! │  magic u32 | version u8 | flags u8 | reserved u16   │
//! │  msg_type i32 | payload_len u32 | sequence u64      │
//! │  checksum u32                                       │
//! ├─────────────────────────────────────────────────────┤
//! │ Payload (variable, bounded by max payload size)     │
//! └─────────────────────────────────────────────────────┘

use thiserror::Error;

pub const HEADER_SIZE: usize = 28;
pub const MAGIC: u32 = 0x4E45_5446; // "NETF"
pub const VERSION: u8 = 1;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 65536;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A frame that can never complete in the receive buffer
    #[error("frame does not fit the {capacity} byte receive buffer")]
    ExceedsBuffer { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    /// Reserved for future use, carried through untouched
    pub flags: u8,
    /// Message type understood by the message factory
    pub msg_type: i32,
    pub payload_len: u32,
    /// Per-connection sequence number assigned by the sender
    pub sequence: u64,
    /// Checksum of the payload, 0 when the sender did not compute one
    pub checksum: u32,
}

impl FrameHeader {
    pub fn new(msg_type: i32, sequence: u64, payload_len: u32) -> Self {
        Self {
            version: VERSION,
            flags: 0,
            msg_type,
            payload_len,
            sequence,
            checksum: 0,
        }
    }

    /// Serialize into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4] = self.version;
        out[5] = self.flags;
        out[6..8].copy_from_slice(&0u16.to_le_bytes());
        out[8..12].copy_from_slice(&self.msg_type.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        out[24..28].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Parse a header from the front of `buf`.
    ///
    /// `Ok(None)` means fewer than [`HEADER_SIZE`] bytes are available yet.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<Self>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = read_u32(buf, 0);
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = buf[4];
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let header = Self {
            version,
            flags: buf[5],
            msg_type: read_u32(buf, 8) as i32,
            payload_len: read_u32(buf, 12),
            sequence: u64::from_le_bytes(take::<8>(buf, 16)),
            checksum: read_u32(buf, 24),
        };

        if header.payload_len as usize > max_payload {
            return Err(FrameError::PayloadTooLarge {
                len: header.payload_len as usize,
                max: max_payload,
            });
        }
        Ok(Some(header))
    }

    /// Total frame size (header + payload)
    #[inline(always)]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

#[inline(always)]
fn take<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

#[inline(always)]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(take::<4>(buf, at))
}

/// Adler-style payload checksum. Never returns 0 for a real payload, so 0
/// stays free to mean "not computed".
#[inline(always)]
pub fn checksum(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for &byte in data {
        a = a.wrapping_add(byte as u32);
        b = b.wrapping_add(a);
    }

    (b << 16) | (a & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = FrameHeader::new(-3, 42, 100);
        header.checksum = 0xDEAD_BEEF;
        let mut buf = [0u8; HEADER_SIZE];
        header.write_to(&mut buf);

        assert_eq!(&buf[0..4], &MAGIC.to_le_bytes());
        assert_eq!(buf[4], VERSION);
        assert_eq!(&buf[8..12], &(-3i32).to_le_bytes());

        let parsed = FrameHeader::parse(&buf, DEFAULT_MAX_PAYLOAD_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_short_buffer_is_incomplete() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert_eq!(FrameHeader::parse(&buf, DEFAULT_MAX_PAYLOAD_SIZE), Ok(None));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let buf = [0xAAu8; HEADER_SIZE];
        assert!(matches!(
            FrameHeader::parse(&buf, DEFAULT_MAX_PAYLOAD_SIZE),
            Err(FrameError::BadMagic(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        FrameHeader::new(1, 0, 1025).write_to(&mut buf);
        assert_eq!(
            FrameHeader::parse(&buf, 1024),
            Err(FrameError::PayloadTooLarge { len: 1025, max: 1024 })
        );
    }

    #[test]
    fn test_checksum_nonzero() {
        assert_ne!(checksum(b""), 0);
        assert_ne!(checksum(b"payload"), checksum(b"paylaod"));
    }
}
