//! Compaction Request Payload
//!
//! Drives one compaction job on a StoC. The LTC ships the full metadata of
//! both input levels plus guide files (the level above the target, used as
//! output split hints) and the current subrange layout; the StoC runs the
//! merge locally against StoC-resident bytes and replies with a
//! `VersionEdit` describing the new and deleted files.

use bytes::{BufMut, Bytes};

use crate::codec;
use crate::error::Result;
use crate::meta::{FileMetaData, SubRange};

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionRequest {
    pub dbname: String,
    pub source_level: u32,
    pub target_level: u32,
    /// Versions at or below this sequence are invisible to all snapshots.
    pub smallest_snapshot: u64,
    /// Input files for `source_level` and `target_level`, in that order.
    pub inputs: [Vec<FileMetaData>; 2],
    /// Files one level past the target; output tables split at their bounds.
    pub guides: Vec<FileMetaData>,
    pub subranges: Vec<SubRange>,
}

fn encode_files(dst: &mut impl BufMut, files: &[FileMetaData]) {
    dst.put_u32_le(files.len() as u32);
    for f in files {
        f.encode(dst);
    }
}

fn decode_files(src: &mut Bytes) -> Result<Vec<FileMetaData>> {
    let n = codec::get_u32(src)? as usize;
    let mut files = Vec::with_capacity(n);
    for _ in 0..n {
        files.push(FileMetaData::decode(src)?);
    }
    Ok(files)
}

impl CompactionRequest {
    pub fn encode(&self, dst: &mut impl BufMut) {
        codec::put_str(dst, &self.dbname);
        dst.put_u32_le(self.source_level);
        dst.put_u32_le(self.target_level);
        dst.put_u64_le(self.smallest_snapshot);
        encode_files(dst, &self.inputs[0]);
        encode_files(dst, &self.inputs[1]);
        encode_files(dst, &self.guides);
        dst.put_u32_le(self.subranges.len() as u32);
        for sr in &self.subranges {
            sr.encode(dst);
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = bytes::BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        let dbname = codec::get_str(src)?;
        let source_level = codec::get_u32(src)?;
        let target_level = codec::get_u32(src)?;
        let smallest_snapshot = codec::get_u64(src)?;
        let inputs = [decode_files(src)?, decode_files(src)?];
        let guides = decode_files(src)?;
        let nsr = codec::get_u32(src)? as usize;
        let mut subranges = Vec::with_capacity(nsr);
        for _ in 0..nsr {
            subranges.push(SubRange::decode(src)?);
        }
        Ok(Self {
            dbname,
            source_level,
            target_level,
            smallest_snapshot,
            inputs,
            guides,
            subranges,
        })
    }

    /// All input and guide metadata, for parallel meta-file fetch.
    pub fn all_files(&self) -> impl Iterator<Item = &FileMetaData> {
        self.inputs[0]
            .iter()
            .chain(self.inputs[1].iter())
            .chain(self.guides.iter())
    }
}
