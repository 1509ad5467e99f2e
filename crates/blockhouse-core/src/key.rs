//! Internal Keys
//!
//! An internal key is a user key plus an 8-byte packed tail holding the
//! sequence number and the value kind. Ordering: user key ascending, then
//! sequence descending — so the newest version of a key sorts first and a
//! merge scan sees it before older versions.

use std::cmp::Ordering;

use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0,
    Value = 1,
}

impl TryFrom<u8> for ValueKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ValueKind::Deletion),
            1 => Ok(ValueKind::Value),
            other => Err(Error::corruption(format!("bad value kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    user_key: Bytes,
    sequence: u64,
    kind: ValueKind,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Bytes>, sequence: u64, kind: ValueKind) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            kind,
        }
    }

    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_deletion(&self) -> bool {
        self.kind == ValueKind::Deletion
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        codec::put_bytes(dst, &self.user_key);
        dst.put_u64_le((self.sequence << 8) | self.kind as u64);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        let user_key = codec::get_bytes(src)?;
        let packed = codec::get_u64(src)?;
        let kind = ValueKind::try_from((packed & 0xff) as u8)?;
        Ok(Self {
            user_key,
            sequence: packed >> 8,
            kind,
        })
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = bytes::BytesMut::with_capacity(self.user_key.len() + 12);
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            // Higher sequence sorts earlier.
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| (other.kind as u8).cmp(&(self.kind as u8)))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
