//! Block Handles
//!
//! Two levels of addressing:
//!
//! - `BlockHandle` addresses a byte range inside one file (offset + size).
//! - `StoCBlockHandle` addresses a byte range anywhere in the cluster:
//!   `(server_id, stoc_file_id, offset, size)`. It is stable for the lifetime
//!   of the referenced segment file.
//!
//! `stoc_file_id == 0` is reserved and means "a node-local file" — the
//! metadata SSTable an LTC keeps beside its db directory is addressed this
//! way so readers can open it without going through the fabric.

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;

/// A byte range inside a single file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_LEN: usize = 16;

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u64_le(self.offset);
        dst.put_u64_le(self.size);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            offset: codec::get_u64(src)?,
            size: codec::get_u64(src)?,
        })
    }
}

/// Globally addresses a contiguous byte range inside a StoC segment file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoCBlockHandle {
    pub server_id: u32,
    pub stoc_file_id: u32,
    pub offset: u64,
    pub size: u64,
}

impl StoCBlockHandle {
    pub const ENCODED_LEN: usize = 24;

    /// The reserved file id meaning "local file on this node".
    pub const LOCAL_FILE_ID: u32 = 0;

    pub fn new(server_id: u32, stoc_file_id: u32, offset: u64, size: u64) -> Self {
        Self {
            server_id,
            stoc_file_id,
            offset,
            size,
        }
    }

    pub fn is_local(&self) -> bool {
        self.stoc_file_id == Self::LOCAL_FILE_ID
    }

    /// Key used to group handles by owning segment: `server_id << 32 | file`.
    pub fn segment_key(&self) -> u64 {
        ((self.server_id as u64) << 32) | self.stoc_file_id as u64
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.server_id);
        dst.put_u32_le(self.stoc_file_id);
        dst.put_u64_le(self.offset);
        dst.put_u64_le(self.size);
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            server_id: codec::get_u32(src)?,
            stoc_file_id: codec::get_u32(src)?,
            offset: codec::get_u64(src)?,
            size: codec::get_u64(src)?,
        })
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = bytes::BytesMut::with_capacity(Self::ENCODED_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_stoc_handle_roundtrip() {
        let h = StoCBlockHandle::new(3, 17, 4096, 65536);
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), StoCBlockHandle::ENCODED_LEN);
        let mut src = buf.freeze();
        assert_eq!(StoCBlockHandle::decode(&mut src).unwrap(), h);
    }

    #[test]
    fn test_local_handle() {
        let h = StoCBlockHandle::new(1, StoCBlockHandle::LOCAL_FILE_ID, 0, 10);
        assert!(h.is_local());
        let h = StoCBlockHandle::new(1, 5, 0, 10);
        assert!(!h.is_local());
    }

    #[test]
    fn test_segment_key_disambiguates_servers() {
        let a = StoCBlockHandle::new(1, 7, 0, 0);
        let b = StoCBlockHandle::new(2, 7, 0, 0);
        assert_ne!(a.segment_key(), b.segment_key());
    }

    #[test]
    fn test_truncated_handle_decode_fails() {
        let mut src = Bytes::from_static(&[0u8; 10]);
        assert!(StoCBlockHandle::decode(&mut src).is_err());
    }
}
