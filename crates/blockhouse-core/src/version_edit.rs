//! Version Edits
//!
//! A `VersionEdit` is the append-only descriptor of one LSM state
//! transition: files added, files deleted, subranges updated, counters
//! advanced. Encode/decode is a strict bijection — the migration image and
//! the remote compaction reply both ride on it.
//!
//! The encoding is tag-based: each present field writes a u32 tag followed
//! by its payload, so optional fields cost nothing when absent and the
//! format can grow.

use bytes::{BufMut, Bytes};

use crate::codec;
use crate::error::{Error, Result};
use crate::key::InternalKey;
use crate::meta::{DeletedFileIdentifier, FileMetaData, SubRange};

mod tag {
    pub const COMPARATOR: u32 = 1;
    pub const NEXT_FILE_NUMBER: u32 = 2;
    pub const LAST_SEQUENCE: u32 = 3;
    pub const COMPACT_POINTER: u32 = 4;
    pub const DELETED_FILE: u32 = 5;
    pub const NEW_FILE: u32 = 6;
    pub const SUBRANGE: u32 = 7;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(u32, InternalKey)>,
    pub deleted_files: Vec<(u32, DeletedFileIdentifier)>,
    pub new_files: Vec<(u32, FileMetaData)>,
    pub new_subranges: Vec<SubRange>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: impl Into<String>) {
        self.comparator_name = Some(name.into());
    }

    pub fn set_next_file(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: u32, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn add_file(&mut self, level: u32, meta: FileMetaData) {
        self.new_files.push((level, meta));
    }

    pub fn delete_file(&mut self, level: u32, memtable_id: u32, fnumber: u64) {
        self.deleted_files.push((
            level,
            DeletedFileIdentifier {
                memtable_id,
                fnumber,
            },
        ));
    }

    pub fn update_subrange(&mut self, sr: SubRange) {
        self.new_subranges.push(sr);
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        if let Some(name) = &self.comparator_name {
            dst.put_u32_le(tag::COMPARATOR);
            codec::put_str(dst, name);
        }
        if let Some(num) = self.next_file_number {
            dst.put_u32_le(tag::NEXT_FILE_NUMBER);
            dst.put_u64_le(num);
        }
        if let Some(seq) = self.last_sequence {
            dst.put_u32_le(tag::LAST_SEQUENCE);
            dst.put_u64_le(seq);
        }
        for (level, key) in &self.compact_pointers {
            dst.put_u32_le(tag::COMPACT_POINTER);
            dst.put_u32_le(*level);
            key.encode(dst);
        }
        for (level, f) in &self.deleted_files {
            dst.put_u32_le(tag::DELETED_FILE);
            dst.put_u32_le(*level);
            dst.put_u32_le(f.memtable_id);
            dst.put_u64_le(f.fnumber);
        }
        for (level, meta) in &self.new_files {
            dst.put_u32_le(tag::NEW_FILE);
            dst.put_u32_le(*level);
            meta.encode(dst);
        }
        for sr in &self.new_subranges {
            dst.put_u32_le(tag::SUBRANGE);
            sr.encode(dst);
        }
    }

    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = bytes::BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        let mut edit = VersionEdit::new();
        while !src.is_empty() {
            let t = codec::get_u32(src)?;
            match t {
                tag::COMPARATOR => edit.comparator_name = Some(codec::get_str(src)?),
                tag::NEXT_FILE_NUMBER => edit.next_file_number = Some(codec::get_u64(src)?),
                tag::LAST_SEQUENCE => edit.last_sequence = Some(codec::get_u64(src)?),
                tag::COMPACT_POINTER => {
                    let level = codec::get_u32(src)?;
                    edit.compact_pointers.push((level, InternalKey::decode(src)?));
                }
                tag::DELETED_FILE => {
                    let level = codec::get_u32(src)?;
                    let memtable_id = codec::get_u32(src)?;
                    let fnumber = codec::get_u64(src)?;
                    edit.deleted_files.push((
                        level,
                        DeletedFileIdentifier {
                            memtable_id,
                            fnumber,
                        },
                    ));
                }
                tag::NEW_FILE => {
                    let level = codec::get_u32(src)?;
                    edit.new_files.push((level, FileMetaData::decode(src)?));
                }
                tag::SUBRANGE => edit.new_subranges.push(SubRange::decode(src)?),
                other => {
                    return Err(Error::corruption(format!("unknown version edit tag {other}")))
                }
            }
        }
        Ok(edit)
    }
}
