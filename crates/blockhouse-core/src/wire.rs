//! Wire Protocol
//!
//! Byte 0 of every frame is the opcode. Integers are fixed-width LE, strings
//! u32 length-prefixed. What crosses the fabric is opaque frames addressed by
//! `(server, region, offset, length)` handles — never raw host addresses; the
//! transport's completion demux correlates responses to request ids on the
//! client side, so frames themselves carry no correlation state.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec;
use crate::compaction::CompactionRequest;
use crate::error::{Error, Result};
use crate::handle::StoCBlockHandle;
use crate::version_edit::VersionEdit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    FlushSstable = 1,
    FlushSstableBuf = 2,
    FlushSstableSucc = 3,
    ReadSstable = 4,
    ReadBlocks = 5,
    AppendBlock = 6,
    AppendBlockSucc = 7,
    Persist = 8,
    PersistSucc = 9,
    Compaction = 10,
    CompactionSucc = 11,
    DeleteTables = 12,
    AllocateLogBuffer = 13,
    AllocateLogBufferSucc = 14,
    ReplicateLog = 15,
    LtcMigration = 16,
}

impl TryFrom<u8> for RequestType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        use RequestType::*;
        Ok(match v {
            1 => FlushSstable,
            2 => FlushSstableBuf,
            3 => FlushSstableSucc,
            4 => ReadSstable,
            5 => ReadBlocks,
            6 => AppendBlock,
            7 => AppendBlockSucc,
            8 => Persist,
            9 => PersistSucc,
            10 => Compaction,
            11 => CompactionSucc,
            12 => DeleteTables,
            13 => AllocateLogBuffer,
            14 => AllocateLogBufferSucc,
            15 => ReplicateLog,
            16 => LtcMigration,
            other => return Err(Error::InvalidRequest(format!("unknown opcode {other}"))),
        })
    }
}

/// Peeks the opcode of a frame without consuming it.
pub fn peek_opcode(frame: &[u8]) -> Result<RequestType> {
    let first = *frame
        .first()
        .ok_or_else(|| Error::InvalidRequest("empty frame".to_string()))?;
    RequestType::try_from(first)
}

/// Scatter write: append a block group (or meta blob) to a StoC segment.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendBlockRequest {
    pub dbname: String,
    pub file_number: u64,
    pub is_meta: bool,
    pub payload: Bytes,
}

impl AppendBlockRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 64);
        buf.put_u8(RequestType::AppendBlock as u8);
        codec::put_str(&mut buf, &self.dbname);
        buf.put_u64_le(self.file_number);
        buf.put_u8(self.is_meta as u8);
        codec::put_bytes(&mut buf, &self.payload);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::AppendBlock)?;
        Ok(Self {
            dbname: codec::get_str(src)?,
            file_number: codec::get_u64(src)?,
            is_meta: codec::get_u8(src)? != 0,
            payload: codec::get_bytes(src)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendBlockResponse {
    pub handle: StoCBlockHandle,
}

impl AppendBlockResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + StoCBlockHandle::ENCODED_LEN);
        buf.put_u8(RequestType::AppendBlockSucc as u8);
        self.handle.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::AppendBlockSucc)?;
        Ok(Self {
            handle: StoCBlockHandle::decode(src)?,
        })
    }
}

/// One-shot flush of a whole SSTable to a single StoC. The segment holding
/// it is sealed once persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushSstableRequest {
    pub dbname: String,
    pub file_number: u64,
    pub payload: Bytes,
}

impl FlushSstableRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 64);
        buf.put_u8(RequestType::FlushSstable as u8);
        codec::put_str(&mut buf, &self.dbname);
        buf.put_u64_le(self.file_number);
        codec::put_bytes(&mut buf, &self.payload);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::FlushSstable)?;
        Ok(Self {
            dbname: codec::get_str(src)?,
            file_number: codec::get_u64(src)?,
            payload: codec::get_bytes(src)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSstableResponse {
    pub handle: StoCBlockHandle,
}

impl FlushSstableResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + StoCBlockHandle::ENCODED_LEN);
        buf.put_u8(RequestType::FlushSstableSucc as u8);
        self.handle.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::FlushSstableSucc)?;
        Ok(Self {
            handle: StoCBlockHandle::decode(src)?,
        })
    }
}

/// Fetch an entire named SSTable block out of one segment (used when the
/// caller holds no offsets, e.g. while rebuilding metadata).
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSstableRequest {
    pub sstable_name: String,
    pub stoc_file_id: u32,
    pub is_meta: bool,
}

impl ReadSstableRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestType::ReadSstable as u8);
        codec::put_str(&mut buf, &self.sstable_name);
        buf.put_u32_le(self.stoc_file_id);
        buf.put_u8(self.is_meta as u8);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::ReadSstable)?;
        Ok(Self {
            sstable_name: codec::get_str(src)?,
            stoc_file_id: codec::get_u32(src)?,
            is_meta: codec::get_u8(src)? != 0,
        })
    }
}

/// Read byte ranges out of one StoC segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBlocksRequest {
    pub sstable_name: String,
    pub stoc_file_id: u32,
    pub ranges: Vec<(u64, u64)>,
}

impl ReadBlocksRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestType::ReadBlocks as u8);
        codec::put_str(&mut buf, &self.sstable_name);
        buf.put_u32_le(self.stoc_file_id);
        buf.put_u32_le(self.ranges.len() as u32);
        for (offset, size) in &self.ranges {
            buf.put_u64_le(*offset);
            buf.put_u64_le(*size);
        }
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::ReadBlocks)?;
        let sstable_name = codec::get_str(src)?;
        let stoc_file_id = codec::get_u32(src)?;
        let n = codec::get_u32(src)? as usize;
        let mut ranges = Vec::with_capacity(n);
        for _ in 0..n {
            ranges.push((codec::get_u64(src)?, codec::get_u64(src)?));
        }
        Ok(Self {
            sstable_name,
            stoc_file_id,
            ranges,
        })
    }
}

/// Persist (fsync + handle lookup) for a list of `(segment, sstable)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistRequest {
    pub is_meta: bool,
    pub pairs: Vec<(u32, String)>,
}

impl PersistRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestType::Persist as u8);
        buf.put_u8(self.is_meta as u8);
        buf.put_u32_le(self.pairs.len() as u32);
        for (id, name) in &self.pairs {
            buf.put_u32_le(*id);
            codec::put_str(&mut buf, name);
        }
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::Persist)?;
        let is_meta = codec::get_u8(src)? != 0;
        let n = codec::get_u32(src)? as usize;
        let mut pairs = Vec::with_capacity(n);
        for _ in 0..n {
            let id = codec::get_u32(src)?;
            pairs.push((id, codec::get_str(src)?));
        }
        Ok(Self { is_meta, pairs })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistResponse {
    pub handles: Vec<StoCBlockHandle>,
    pub sealed: bool,
}

impl PersistResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestType::PersistSucc as u8);
        buf.put_u8(self.sealed as u8);
        buf.put_u32_le(self.handles.len() as u32);
        for h in &self.handles {
            h.encode(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::PersistSucc)?;
        let sealed = codec::get_u8(src)? != 0;
        let n = codec::get_u32(src)? as usize;
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            handles.push(StoCBlockHandle::decode(src)?);
        }
        Ok(Self { handles, sealed })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionRequestFrame {
    pub request: CompactionRequest,
}

impl CompactionRequestFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestType::Compaction as u8);
        self.request.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::Compaction)?;
        Ok(Self {
            request: CompactionRequest::decode(src)?,
        })
    }
}

/// The compaction reply is a `VersionEdit`: new files at the target level
/// plus deletions of the inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResponse {
    pub edit: VersionEdit,
}

impl CompactionResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestType::CompactionSucc as u8);
        self.edit.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::CompactionSucc)?;
        Ok(Self {
            edit: VersionEdit::decode(src)?,
        })
    }
}

/// Fire-and-forget deletion of obsolete tables.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteTablesRequest {
    pub dbname: String,
    pub file_numbers: Vec<u64>,
}

impl DeleteTablesRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestType::DeleteTables as u8);
        codec::put_str(&mut buf, &self.dbname);
        buf.put_u32_le(self.file_numbers.len() as u32);
        for fnum in &self.file_numbers {
            buf.put_u64_le(*fnum);
        }
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::DeleteTables)?;
        let dbname = codec::get_str(src)?;
        let n = codec::get_u32(src)? as usize;
        let mut file_numbers = Vec::with_capacity(n);
        for _ in 0..n {
            file_numbers.push(codec::get_u64(src)?);
        }
        Ok(Self {
            dbname,
            file_numbers,
        })
    }
}

/// WAL replication buffer allocation (the log-replication collaborators ride
/// on this; the storage side only vends the region).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocateLogBufferRequest {
    pub dbid: u32,
    pub size: u64,
}

impl AllocateLogBufferRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(RequestType::AllocateLogBuffer as u8);
        buf.put_u32_le(self.dbid);
        buf.put_u64_le(self.size);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::AllocateLogBuffer)?;
        Ok(Self {
            dbid: codec::get_u32(src)?,
            size: codec::get_u64(src)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocateLogBufferResponse {
    pub region_id: u32,
    pub offset: u64,
    pub size: u64,
}

impl AllocateLogBufferResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u8(RequestType::AllocateLogBufferSucc as u8);
        buf.put_u32_le(self.region_id);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::AllocateLogBufferSucc)?;
        Ok(Self {
            region_id: codec::get_u32(src)?,
            offset: codec::get_u64(src)?,
            size: codec::get_u64(src)?,
        })
    }
}

/// A migration image frame: opcode plus the encoded database image.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationFrame {
    pub image: Bytes,
}

impl MigrationFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.image.len());
        buf.put_u8(RequestType::LtcMigration as u8);
        buf.put_slice(&self.image);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        expect_opcode(src, RequestType::LtcMigration)?;
        Ok(Self { image: src.clone() })
    }
}

fn expect_opcode(src: &mut Bytes, want: RequestType) -> Result<()> {
    let got = RequestType::try_from(codec::get_u8(src)?)?;
    if got != want {
        return Err(Error::InvalidRequest(format!(
            "expected {want:?} frame, got {got:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for v in 1u8..=16 {
            let op = RequestType::try_from(v).unwrap();
            assert_eq!(op as u8, v);
        }
        assert!(RequestType::try_from(0).is_err());
        assert!(RequestType::try_from(17).is_err());
    }

    #[test]
    fn test_append_block_roundtrip() {
        let req = AppendBlockRequest {
            dbname: "db-0".to_string(),
            file_number: 12,
            is_meta: true,
            payload: Bytes::from_static(b"block bytes"),
        };
        let mut frame = req.encode();
        assert_eq!(peek_opcode(&frame).unwrap(), RequestType::AppendBlock);
        assert_eq!(AppendBlockRequest::decode(&mut frame).unwrap(), req);
    }

    #[test]
    fn test_read_blocks_roundtrip() {
        let req = ReadBlocksRequest {
            sstable_name: "000007".to_string(),
            stoc_file_id: 3,
            ranges: vec![(0, 4096), (8192, 100)],
        };
        let mut frame = req.encode();
        assert_eq!(ReadBlocksRequest::decode(&mut frame).unwrap(), req);
    }

    #[test]
    fn test_persist_roundtrip() {
        let req = PersistRequest {
            is_meta: false,
            pairs: vec![(1, "000004".to_string()), (2, "000005".to_string())],
        };
        let mut frame = req.encode();
        assert_eq!(PersistRequest::decode(&mut frame).unwrap(), req);

        let resp = PersistResponse {
            handles: vec![StoCBlockHandle::new(1, 2, 0, 100)],
            sealed: true,
        };
        let mut frame = resp.encode();
        assert_eq!(PersistResponse::decode(&mut frame).unwrap(), resp);
    }

    #[test]
    fn test_delete_tables_roundtrip() {
        let req = DeleteTablesRequest {
            dbname: "db-1".to_string(),
            file_numbers: vec![9, 10, 11],
        };
        let mut frame = req.encode();
        assert_eq!(DeleteTablesRequest::decode(&mut frame).unwrap(), req);
    }

    #[test]
    fn test_wrong_opcode_rejected() {
        let req = DeleteTablesRequest {
            dbname: "db".to_string(),
            file_numbers: vec![],
        };
        let mut frame = req.encode();
        assert!(PersistRequest::decode(&mut frame).is_err());
    }
}
