//! SSTable Metadata
//!
//! `FileMetaData` is what an LTC publishes when an SSTable finalizes: the
//! meta-blob handle plus one handle per scattered data-block group, in group
//! (and therefore key) order. The sum of the group handle sizes equals the
//! logical data region of the table.

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::handle::StoCBlockHandle;
use crate::key::InternalKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    /// Globally unique table number, never reused.
    pub number: u64,
    /// Memtable this table was flushed from (0 for compaction outputs).
    pub memtable_id: u32,
    /// Size of the original in-memory SSTable.
    pub file_size: u64,
    /// Size of the rewritten metadata blob.
    pub converted_file_size: u64,
    pub flush_timestamp: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Contiguous blob holding filter, metaindex, rewritten index, footer.
    pub meta_block_handle: StoCBlockHandle,
    /// One handle per scatter group, in key order. Never empty.
    pub data_block_group_handles: Vec<StoCBlockHandle>,
}

impl FileMetaData {
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u64_le(self.number);
        dst.put_u32_le(self.memtable_id);
        dst.put_u64_le(self.file_size);
        dst.put_u64_le(self.converted_file_size);
        dst.put_u64_le(self.flush_timestamp);
        self.smallest.encode(dst);
        self.largest.encode(dst);
        self.meta_block_handle.encode(dst);
        dst.put_u32_le(self.data_block_group_handles.len() as u32);
        for h in &self.data_block_group_handles {
            h.encode(dst);
        }
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        let number = codec::get_u64(src)?;
        let memtable_id = codec::get_u32(src)?;
        let file_size = codec::get_u64(src)?;
        let converted_file_size = codec::get_u64(src)?;
        let flush_timestamp = codec::get_u64(src)?;
        let smallest = InternalKey::decode(src)?;
        let largest = InternalKey::decode(src)?;
        let meta_block_handle = StoCBlockHandle::decode(src)?;
        let ngroups = codec::get_u32(src)? as usize;
        if ngroups == 0 {
            return Err(Error::corruption("file metadata with zero groups"));
        }
        let mut data_block_group_handles = Vec::with_capacity(ngroups);
        for _ in 0..ngroups {
            data_block_group_handles.push(StoCBlockHandle::decode(src)?);
        }
        Ok(Self {
            number,
            memtable_id,
            file_size,
            converted_file_size,
            flush_timestamp,
            smallest,
            largest,
            meta_block_handle,
            data_block_group_handles,
        })
    }

    /// Size of the logical data region: the sum of all group handles.
    pub fn data_region_size(&self) -> u64 {
        self.data_block_group_handles.iter().map(|h| h.size).sum()
    }
}

/// Identifies a deleted file inside a `VersionEdit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletedFileIdentifier {
    pub memtable_id: u32,
    pub fnumber: u64,
}

/// A key subrange owned by one memtable partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRange {
    pub subrange_id: u32,
    pub lower: Bytes,
    pub upper: Bytes,
    pub lower_inclusive: bool,
    pub upper_inclusive: bool,
}

impl SubRange {
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.subrange_id);
        codec::put_bytes(dst, &self.lower);
        codec::put_bytes(dst, &self.upper);
        dst.put_u8(self.lower_inclusive as u8);
        dst.put_u8(self.upper_inclusive as u8);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        Ok(Self {
            subrange_id: codec::get_u32(src)?,
            lower: codec::get_bytes(src)?,
            upper: codec::get_bytes(src)?,
            lower_inclusive: codec::get_u8(src)? != 0,
            upper_inclusive: codec::get_u8(src)? != 0,
        })
    }
}
