//! Version Set
//!
//! The leveled file state of one database plus its counters. Transitions
//! arrive as `VersionEdit`s (from flushes, remote compactions, or a
//! migration image) and are applied under the per-database lock. The table
//! id mapping records, per file number, every segment handle the table
//! occupies — migration ships it, and best-effort deletion routes by it.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use blockhouse_core::codec;
use blockhouse_core::{Error, FileMetaData, Result, StoCBlockHandle, VersionEdit};

pub const NUM_LEVELS: usize = 7;

#[derive(Debug)]
pub struct VersionSet {
    levels: Vec<Vec<FileMetaData>>,
    last_sequence: u64,
    next_file_number: u64,
    comparator_name: String,
    /// file number -> every handle the table occupies (meta + groups).
    table_mapping: HashMap<u64, Vec<StoCBlockHandle>>,
}

impl Default for VersionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionSet {
    pub fn new() -> Self {
        Self {
            levels: vec![Vec::new(); NUM_LEVELS],
            last_sequence: 0,
            next_file_number: 1,
            comparator_name: "bytewise".to_string(),
            table_mapping: HashMap::new(),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    /// Mint a new globally unique file number; never reused.
    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    pub fn files(&self, level: u32) -> &[FileMetaData] {
        &self.levels[level as usize]
    }

    pub fn num_files(&self, level: u32) -> usize {
        self.levels[level as usize].len()
    }

    pub fn table_handles(&self, number: u64) -> Option<&Vec<StoCBlockHandle>> {
        self.table_mapping.get(&number)
    }

    /// Files of `level` whose key range intersects `[smallest, largest]`
    /// (by user key).
    pub fn overlapping_files(
        &self,
        level: u32,
        smallest: &[u8],
        largest: &[u8],
    ) -> Vec<FileMetaData> {
        self.levels[level as usize]
            .iter()
            .filter(|f| {
                f.largest.user_key() >= smallest && f.smallest.user_key() <= largest
            })
            .cloned()
            .collect()
    }

    /// Apply one transition. Deletions match on file number; additions are
    /// kept sorted by smallest key within their level.
    pub fn apply(&mut self, edit: &VersionEdit) {
        if let Some(seq) = edit.last_sequence {
            if seq > self.last_sequence {
                self.last_sequence = seq;
            }
        }
        if let Some(next) = edit.next_file_number {
            if next > self.next_file_number {
                self.next_file_number = next;
            }
        }
        if let Some(name) = &edit.comparator_name {
            self.comparator_name = name.clone();
        }
        for (level, deleted) in &edit.deleted_files {
            self.levels[*level as usize].retain(|f| f.number != deleted.fnumber);
            self.table_mapping.remove(&deleted.fnumber);
        }
        for (level, meta) in &edit.new_files {
            let mut handles = vec![meta.meta_block_handle];
            handles.extend(meta.data_block_group_handles.iter().copied());
            self.table_mapping.insert(meta.number, handles);
            let files = &mut self.levels[*level as usize];
            files.push(meta.clone());
            files.sort_by(|a, b| a.smallest.cmp(&b.smallest).then(a.number.cmp(&b.number)));
            // Numbers minted on a StoC embed the node id in the high half;
            // only coordinator-minted numbers advance this counter, so the
            // sequential space never drifts into another node's range.
            if meta.number < (1 << 32) && meta.number >= self.next_file_number {
                self.next_file_number = meta.number + 1;
            }
        }
    }

    /// One self-contained edit describing the whole state.
    pub fn encode_snapshot(&self) -> Bytes {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.comparator_name.clone());
        edit.set_next_file(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);
        for (level, files) in self.levels.iter().enumerate() {
            for meta in files {
                edit.add_file(level as u32, meta.clone());
            }
        }
        edit.encode_to_bytes()
    }

    /// Rebuild from a snapshot blob, then pin the counters to the values
    /// the migration header carried.
    pub fn restore(src: &mut Bytes, last_sequence: u64, next_file_number: u64) -> Result<Self> {
        let edit = VersionEdit::decode(src)?;
        let mut vs = VersionSet::new();
        vs.apply(&edit);
        vs.last_sequence = last_sequence;
        if next_file_number < vs.next_file_number {
            return Err(Error::corruption(
                "migration header rewinds the file number space",
            ));
        }
        vs.next_file_number = next_file_number;
        Ok(vs)
    }

    pub fn encode_table_mapping(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.table_mapping.len() as u32);
        let mut numbers: Vec<&u64> = self.table_mapping.keys().collect();
        numbers.sort_unstable();
        for number in numbers {
            let handles = &self.table_mapping[number];
            buf.put_u64_le(*number);
            buf.put_u32_le(handles.len() as u32);
            for h in handles {
                h.encode(&mut buf);
            }
        }
        buf.freeze()
    }

    pub fn decode_table_mapping(&mut self, src: &mut Bytes) -> Result<()> {
        let n = codec::get_u32(src)? as usize;
        for _ in 0..n {
            let number = codec::get_u64(src)?;
            let count = codec::get_u32(src)? as usize;
            let mut handles = Vec::with_capacity(count);
            for _ in 0..count {
                handles.push(StoCBlockHandle::decode(src)?);
            }
            self.table_mapping.insert(number, handles);
        }
        Ok(())
    }
}
