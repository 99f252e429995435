//! Needle record codec.
//!
//! A needle is one stored object, laid out as:
//!
//! ```text
//! | header magic (4) | cookie (4) | key (8) | flag (1) | size (4) |
//! | data (size) |
//! | footer magic (4) | checksum (4) | padding (0-7) |
//! ```
//!
//! All integers are big-endian. Records are padded with zero bytes to an
//! 8-byte boundary, so superblock offsets fit a `u32` counted in 8-byte
//! units.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, StoreError};

/// Marks the start of a needle header.
pub const HEADER_MAGIC: [u8; 4] = [0x12, 0x34, 0x56, 0x78];
/// Marks the start of a needle footer.
pub const FOOTER_MAGIC: [u8; 4] = [0x87, 0x65, 0x43, 0x21];

/// Alignment unit in bytes. Offsets are counted in these units, so a `u32`
/// offset addresses 32 GiB. Changing this breaks the on-disk format.
pub const PADDING: u32 = 8;

/// Fixed header size: magic + cookie + key + flag + size.
pub const HEADER_SIZE: usize = 4 + 4 + 8 + 1 + 4;
/// Fixed footer size before padding: magic + checksum.
pub const FOOTER_SIZE: usize = 4 + 4;
/// Byte offset of the flag within a record, for in-place delete flips.
pub const FLAG_OFFSET: u64 = 4 + 4 + 8;

/// Hard ceiling on needle data size.
pub const MAX_DATA_SIZE: usize = 5 * 1024 * 1024;

/// Packed-cache offset value marking a deleted needle.
pub const CACHE_DEL_OFFSET: u32 = 0;

const PADDING_BYTES: [u8; 7] = [0; 7];

/// Needle liveness flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Ok = 0,
    Deleted = 1,
}

impl Flag {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Deleted),
            other => Err(StoreError::NeedleFlag(other)),
        }
    }
}

/// One decoded needle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Needle {
    pub key: i64,
    pub cookie: i32,
    pub flag: Flag,
    /// Data size in bytes.
    pub size: i32,
    pub data: Vec<u8>,
    /// CRC32 over `data`.
    pub checksum: u32,
    /// Trailing zero bytes after the footer, `0..8`.
    pub padding_size: i32,
    /// Full record size including padding, always a multiple of 8.
    pub total_size: i32,
}

/// Round up to the next 8-byte boundary.
fn align(n: i32) -> i32 {
    (n + (PADDING as i32 - 1)) & !(PADDING as i32 - 1)
}

/// Convert a byte position into an 8-byte-unit offset.
pub fn needle_offset(byte_offset: u64) -> u32 {
    (byte_offset / u64::from(PADDING)) as u32
}

/// Convert an 8-byte-unit offset back into a byte position.
pub fn block_offset(offset: u32) -> u64 {
    u64::from(offset) * u64::from(PADDING)
}

/// Full aligned record size for a payload of `data_len` bytes.
pub fn record_size(data_len: usize) -> i32 {
    align((HEADER_SIZE + FOOTER_SIZE + data_len) as i32)
}

/// Largest possible record size for the given data ceiling.
pub fn max_record_size(max_data: usize) -> i32 {
    record_size(max_data)
}

/// Pack an offset and a record size into one cache value.
pub fn cache_pack(offset: u32, size: i32) -> i64 {
    (i64::from(offset) << 32) | i64::from(size as u32)
}

/// Split a cache value back into offset and record size.
pub fn cache_unpack(nc: i64) -> (u32, i32) {
    ((nc >> 32) as u32, nc as i32)
}

impl Needle {
    /// Build a live needle around `data`, computing checksum and padding.
    pub fn new(key: i64, cookie: i32, data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(StoreError::NeedleSize(0));
        }
        if data.len() > MAX_DATA_SIZE {
            return Err(StoreError::NeedleTooLarge(data.len()));
        }
        let size = data.len() as i32;
        let unpadded = (HEADER_SIZE + FOOTER_SIZE) as i32 + size;
        let total_size = align(unpadded);
        Ok(Self {
            key,
            cookie,
            flag: Flag::Ok,
            size,
            checksum: crc32fast::hash(&data),
            padding_size: total_size - unpadded,
            total_size,
            data,
        })
    }

    /// Offset units this record occupies in a superblock.
    pub fn incr_offset(&self) -> u32 {
        (self.total_size as u32) / PADDING
    }

    /// Parse the fixed-size header, leaving `data` empty.
    pub fn parse_header(buf: &[u8]) -> Result<Self> {
        let mut rd = buf;
        let mut magic = [0u8; 4];
        rd.read_exact(&mut magic)?;
        if magic != HEADER_MAGIC {
            return Err(StoreError::NeedleHeaderMagic);
        }
        let cookie = rd.read_i32::<BigEndian>()?;
        let key = rd.read_i64::<BigEndian>()?;
        let flag = Flag::from_byte(rd.read_u8()?)?;
        let size = rd.read_i32::<BigEndian>()?;
        if size < 1 || size as usize > MAX_DATA_SIZE {
            return Err(StoreError::NeedleSize(size));
        }
        let unpadded = (HEADER_SIZE + FOOTER_SIZE) as i32 + size;
        let total_size = align(unpadded);
        Ok(Self {
            key,
            cookie,
            flag,
            size,
            data: Vec::new(),
            checksum: 0,
            padding_size: total_size - unpadded,
            total_size,
        })
    }

    /// Parse data, footer and padding. `buf` must run from the data start
    /// to the record end.
    pub fn parse_footer(&mut self, buf: &[u8]) -> Result<()> {
        let rest = (self.total_size as usize) - HEADER_SIZE;
        if buf.len() != rest {
            return Err(StoreError::NeedleSize(self.size));
        }
        let (data, tail) = buf.split_at(self.size as usize);
        let mut rd = tail;
        let mut magic = [0u8; 4];
        rd.read_exact(&mut magic)?;
        if magic != FOOTER_MAGIC {
            return Err(StoreError::NeedleFooterMagic);
        }
        let expected = rd.read_u32::<BigEndian>()?;
        let actual = crc32fast::hash(data);
        if expected != actual {
            return Err(StoreError::NeedleChecksum { expected, actual });
        }
        if !rd.iter().all(|&b| b == 0) {
            return Err(StoreError::NeedlePadding);
        }
        self.data = data.to_vec();
        self.checksum = actual;
        Ok(())
    }

    /// Parse one whole record from `buf`, which must be exactly the record.
    pub fn parse_bytes(buf: &[u8]) -> Result<Self> {
        let mut n = Self::parse_header(buf)?;
        if buf.len() != n.total_size as usize {
            return Err(StoreError::NeedleSize(n.size));
        }
        n.parse_footer(&buf[HEADER_SIZE..])?;
        Ok(n)
    }

    /// Read and parse one record from a sequential reader. A clean EOF at a
    /// record boundary surfaces as an `UnexpectedEof` I/O error.
    pub fn parse_from<R: Read>(rd: &mut R) -> Result<Self> {
        let mut hdr = [0u8; HEADER_SIZE];
        rd.read_exact(&mut hdr)?;
        let mut n = Self::parse_header(&hdr)?;
        let mut buf = vec![0u8; (n.total_size as usize) - HEADER_SIZE];
        rd.read_exact(&mut buf)?;
        n.parse_footer(&buf)?;
        Ok(n)
    }

    /// Serialize the header.
    pub fn write_header_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&HEADER_MAGIC)?;
        w.write_i32::<BigEndian>(self.cookie)?;
        w.write_i64::<BigEndian>(self.key)?;
        w.write_u8(self.flag as u8)?;
        w.write_i32::<BigEndian>(self.size)?;
        Ok(())
    }

    /// Serialize the footer and padding.
    pub fn write_footer_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&FOOTER_MAGIC)?;
        w.write_u32::<BigEndian>(self.checksum)?;
        w.write_all(&PADDING_BYTES[..self.padding_size as usize])?;
        Ok(())
    }

    /// Serialize the whole record.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        self.write_header_to(w)?;
        w.write_all(&self.data)?;
        self.write_footer_to(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode(n: &Needle) -> Vec<u8> {
        let mut buf = Vec::new();
        n.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip_preserves_fields() {
        let n = Needle::new(42, 0x1234, b"hello world".to_vec()).unwrap();
        let buf = encode(&n);
        assert_eq!(buf.len(), n.total_size as usize);
        let parsed = Needle::parse_bytes(&buf).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn concrete_sizes() {
        // 4-byte payload: 21 + 4 + 8 = 33, padded to 40.
        let n = Needle::new(1, 0, b"test".to_vec()).unwrap();
        assert_eq!(n.total_size, 40);
        assert_eq!(n.padding_size, 7);
        assert_eq!(n.incr_offset(), 5);
    }

    #[test]
    fn alignment_holds_for_all_small_sizes() {
        for len in 1..=64usize {
            let n = Needle::new(1, 0, vec![0xAB; len]).unwrap();
            assert_eq!(n.total_size % 8, 0, "len {len}");
            assert!(n.padding_size < 8, "len {len}");
            assert_eq!(
                n.total_size,
                (HEADER_SIZE + FOOTER_SIZE + len) as i32 + n.padding_size
            );
            let parsed = Needle::parse_bytes(&encode(&n)).unwrap();
            assert_eq!(parsed.data, n.data);
        }
    }

    #[test]
    fn empty_data_rejected() {
        assert!(matches!(
            Needle::new(1, 0, Vec::new()),
            Err(StoreError::NeedleSize(0))
        ));
    }

    #[test]
    fn staged_write_matches_one_shot() {
        let n = Needle::new(7, 9, b"staged".to_vec()).unwrap();
        let mut staged = Vec::new();
        n.write_header_to(&mut staged).unwrap();
        staged.extend_from_slice(&n.data);
        n.write_footer_to(&mut staged).unwrap();
        assert_eq!(staged, encode(&n));
    }

    #[test]
    fn header_magic_mismatch() {
        let mut buf = encode(&Needle::new(1, 0, b"abc".to_vec()).unwrap());
        buf[0] ^= 0xFF;
        assert!(matches!(
            Needle::parse_bytes(&buf),
            Err(StoreError::NeedleHeaderMagic)
        ));
    }

    #[test]
    fn footer_magic_mismatch() {
        let n = Needle::new(1, 0, b"abc".to_vec()).unwrap();
        let mut buf = encode(&n);
        buf[HEADER_SIZE + n.size as usize] ^= 0xFF;
        assert!(matches!(
            Needle::parse_bytes(&buf),
            Err(StoreError::NeedleFooterMagic)
        ));
    }

    #[test]
    fn invalid_flag_rejected() {
        let mut buf = encode(&Needle::new(1, 0, b"abc".to_vec()).unwrap());
        buf[FLAG_OFFSET as usize] = 7;
        assert!(matches!(
            Needle::parse_bytes(&buf),
            Err(StoreError::NeedleFlag(7))
        ));
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut buf = encode(&Needle::new(1, 0, b"abcdef".to_vec()).unwrap());
        buf[HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            Needle::parse_bytes(&buf),
            Err(StoreError::NeedleChecksum { .. })
        ));
    }

    #[test]
    fn dirty_padding_rejected() {
        let n = Needle::new(1, 0, b"abc".to_vec()).unwrap();
        assert!(n.padding_size > 0);
        let mut buf = encode(&n);
        let last = buf.len() - 1;
        buf[last] = 0xFF;
        assert!(matches!(
            Needle::parse_bytes(&buf),
            Err(StoreError::NeedlePadding)
        ));
    }

    #[test]
    fn zero_size_header_rejected() {
        let n = Needle::new(1, 0, b"abc".to_vec()).unwrap();
        let mut buf = encode(&n);
        // size field sits right after the flag
        buf[HEADER_SIZE - 4..HEADER_SIZE].copy_from_slice(&0i32.to_be_bytes());
        assert!(matches!(
            Needle::parse_bytes(&buf),
            Err(StoreError::NeedleSize(0))
        ));
    }

    #[test]
    fn cache_pack_round_trip() {
        for &(offset, size) in &[(1u32, 40i32), (0, 40), (u32::MAX, i32::MAX)] {
            assert_eq!(cache_unpack(cache_pack(offset, size)), (offset, size));
        }
    }

    #[test]
    fn offset_conversions() {
        assert_eq!(needle_offset(8), 1);
        assert_eq!(block_offset(1), 8);
        assert_eq!(block_offset(needle_offset(48)), 48);
    }
}
