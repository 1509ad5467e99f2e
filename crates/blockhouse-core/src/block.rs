//! Block Format
//!
//! Every block written through the table builder — data, filter, metaindex,
//! index — is `contents || trailer`, where the 6-byte trailer is:
//!
//! ```text
//! ┌──────────────┬────────────────┬──────────────┐
//! │ compression  │ masked CRC32   │ sentinel '!' │
//! │ (1 byte)     │ (4 bytes, LE)  │ (1 byte)     │
//! └──────────────┴────────────────┴──────────────┘
//! ```
//!
//! The CRC covers the (possibly compressed) contents plus the compression
//! byte and is masked so that storing a CRC of data that itself contains CRCs
//! stays well-distributed. The terminal sentinel is non-zero by construction:
//! readers polling a buffer filled by a one-sided remote write treat an
//! all-zero tail as "not landed yet" and re-poll instead of paying an ACK
//! round trip.
//!
//! An SSTable ends with a fixed-size footer: metaindex handle, index handle,
//! magic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::handle::BlockHandle;

pub const BLOCK_TRAILER_SIZE: usize = 6;
pub const BLOCK_SENTINEL: u8 = b'!';

pub const FOOTER_SIZE: usize = 2 * BlockHandle::ENCODED_LEN + 8;
pub const TABLE_MAGIC: u64 = 0x8c3a_52d1_90b1_77e4;

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

impl TryFrom<u8> for Compression {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            other => Err(Error::corruption(format!("bad compression type {other}"))),
        }
    }
}

/// Mask a CRC so CRCs of CRC-bearing data stay well distributed.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

fn trailer_crc(contents: &[u8], compression: Compression) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(contents);
    hasher.update(&[compression as u8]);
    mask_crc(hasher.finalize())
}

/// Finish a raw block: compress if it pays off, append the trailer.
/// Lz4 is only kept when it saves at least 1/8th of the raw size.
pub fn seal_block(raw: &[u8], compression: Compression) -> Vec<u8> {
    let (contents, kind) = match compression {
        Compression::None => (raw.to_vec(), Compression::None),
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(raw);
            if compressed.len() < raw.len() - raw.len() / 8 {
                (compressed, Compression::Lz4)
            } else {
                (raw.to_vec(), Compression::None)
            }
        }
    };
    let crc = trailer_crc(&contents, kind);
    let mut out = contents;
    out.reserve(BLOCK_TRAILER_SIZE);
    out.push(kind as u8);
    out.extend_from_slice(&crc.to_le_bytes());
    out.push(BLOCK_SENTINEL);
    out
}

/// Verify and strip the trailer of a sealed block; decompress if needed.
pub fn open_block(sealed: &[u8]) -> Result<Bytes> {
    if sealed.len() < BLOCK_TRAILER_SIZE {
        return Err(Error::corruption("block shorter than trailer"));
    }
    let (contents, trailer) = sealed.split_at(sealed.len() - BLOCK_TRAILER_SIZE);
    if trailer[BLOCK_TRAILER_SIZE - 1] != BLOCK_SENTINEL {
        return Err(Error::corruption("block sentinel missing"));
    }
    let kind = Compression::try_from(trailer[0])?;
    let stored = u32::from_le_bytes([trailer[1], trailer[2], trailer[3], trailer[4]]);
    if stored != trailer_crc(contents, kind) {
        return Err(Error::corruption("block crc mismatch"));
    }
    match kind {
        Compression::None => Ok(Bytes::copy_from_slice(contents)),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(contents)
            .map(Bytes::from)
            .map_err(|e| Error::corruption(format!("lz4: {e}"))),
    }
}

/// One-sided write landing check: an all-zero tail means the bytes are not
/// there yet. The sealed-block trailer guarantees a non-zero last byte.
pub fn is_write_complete(buf: &[u8]) -> bool {
    buf.last().copied().unwrap_or(0) != 0
}

/// SSTable footer: fixed size, trailing magic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self, dst: &mut impl BufMut) {
        self.metaindex_handle.encode(dst);
        self.index_handle.encode(dst);
        dst.put_u64_le(TABLE_MAGIC);
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode from the trailing `FOOTER_SIZE` bytes of a table or meta blob.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < FOOTER_SIZE {
            return Err(Error::corruption("footer truncated"));
        }
        let mut src = &raw[raw.len() - FOOTER_SIZE..];
        let metaindex_handle = BlockHandle::decode(&mut src)?;
        let index_handle = BlockHandle::decode(&mut src)?;
        let magic = src.get_u64_le();
        if magic != TABLE_MAGIC {
            return Err(Error::corruption(format!("bad table magic {magic:#x}")));
        }
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Builds a block of length-prefixed key/value entries.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    buf: BytesMut,
    entries: usize,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(key);
        self.buf.put_slice(value);
        self.entries += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn num_entries(&self) -> usize {
        self.entries
    }

    /// Current unsealed size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(&mut self) -> Bytes {
        self.entries = 0;
        self.buf.split().freeze()
    }
}

/// Parse the entries of an opened (trailer-stripped) block.
pub fn parse_entries(mut contents: Bytes) -> Result<Vec<(Bytes, Bytes)>> {
    let mut entries = Vec::new();
    while !contents.is_empty() {
        let klen = crate::codec::get_u32(&mut contents)? as usize;
        let vlen = crate::codec::get_u32(&mut contents)? as usize;
        if contents.remaining() < klen + vlen {
            return Err(Error::corruption("block entry truncated"));
        }
        let key = contents.split_to(klen);
        let value = contents.split_to(vlen);
        entries.push((key, value));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip_none() {
        let sealed = seal_block(b"hello block", Compression::None);
        assert_eq!(sealed.len(), 11 + BLOCK_TRAILER_SIZE);
        assert_eq!(*sealed.last().unwrap(), BLOCK_SENTINEL);
        assert_eq!(open_block(&sealed).unwrap(), Bytes::from_static(b"hello block"));
    }

    #[test]
    fn test_seal_open_roundtrip_lz4() {
        let raw = vec![7u8; 64 * 1024];
        let sealed = seal_block(&raw, Compression::Lz4);
        assert!(sealed.len() < raw.len() / 2);
        assert_eq!(*sealed.last().unwrap(), BLOCK_SENTINEL);
        assert_eq!(open_block(&sealed).unwrap().as_ref(), raw.as_slice());
    }

    #[test]
    fn test_incompressible_falls_back_to_none() {
        // High-entropy bytes: lz4 cannot save 1/8th, so the block stays raw.
        let raw: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let sealed = seal_block(&raw, Compression::Lz4);
        assert_eq!(sealed[sealed.len() - BLOCK_TRAILER_SIZE], Compression::None as u8);
        assert_eq!(open_block(&sealed).unwrap().as_ref(), raw.as_slice());
    }

    #[test]
    fn test_flipped_bit_is_corruption() {
        let mut sealed = seal_block(b"payload", Compression::None);
        sealed[2] ^= 0x40;
        assert!(matches!(open_block(&sealed), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_crc_mask_roundtrip() {
        for crc in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(unmask_crc(mask_crc(crc)), crc);
        }
    }

    #[test]
    fn test_write_complete_sentinel() {
        assert!(!is_write_complete(&[0, 0, 0, 0]));
        assert!(!is_write_complete(&[]));
        let sealed = seal_block(b"x", Compression::None);
        assert!(is_write_complete(&sealed));
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(100, 20),
            index_handle: BlockHandle::new(126, 300),
        };
        let raw = footer.encode_to_bytes();
        assert_eq!(raw.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&raw).unwrap(), footer);
    }

    #[test]
    fn test_footer_bad_magic() {
        let footer = Footer::default();
        let mut raw = footer.encode_to_bytes().to_vec();
        let len = raw.len();
        raw[len - 1] ^= 0xff;
        assert!(Footer::decode(&raw).is_err());
    }

    #[test]
    fn test_block_builder_entries() {
        let mut builder = BlockBuilder::new();
        builder.add(b"k1", b"v1");
        builder.add(b"k2", b"value-two");
        assert_eq!(builder.num_entries(), 2);
        let contents = builder.finish();
        let entries = parse_entries(contents).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.as_ref(), b"k1");
        assert_eq!(entries[1].1.as_ref(), b"value-two");
    }

    #[test]
    fn test_sealed_block_through_parse() {
        let mut builder = BlockBuilder::new();
        for i in 0..50 {
            builder.add(format!("key-{i:03}").as_bytes(), format!("val-{i}").as_bytes());
        }
        let sealed = seal_block(&builder.finish(), Compression::Lz4);
        let entries = parse_entries(open_block(&sealed).unwrap()).unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[49].0.as_ref(), b"key-049");
    }
}
