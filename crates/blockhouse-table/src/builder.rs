//! Table Builder
//!
//! Cuts ordered key/value pairs into data blocks inside a `ScatterFile`,
//! then lays down the classic tail: filter block, metaindex block, index
//! block, footer. Keys must arrive in strictly ascending internal-key order.

use bytes::Bytes;

use blockhouse_core::block::{
    seal_block, BlockBuilder, Compression, Footer, BLOCK_TRAILER_SIZE,
};
use blockhouse_core::{BlockHandle, Error, InternalKey, Result};

use crate::bloom::BloomFilter;
use crate::scatter::{ScatterFile, FILTER_KEY};

const FILTER_BITS_PER_KEY: usize = 10;

pub struct TableBuilder<'a> {
    file: &'a mut ScatterFile,
    block_size: usize,
    compression: Compression,
    data_block: BlockBuilder,
    index: Vec<(Bytes, BlockHandle)>,
    filter_keys: Vec<Bytes>,
    last_key: Option<InternalKey>,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
    num_entries: u64,
    num_data_blocks: usize,
}

impl<'a> TableBuilder<'a> {
    pub fn new(file: &'a mut ScatterFile, block_size: usize, compression: Compression) -> Self {
        Self {
            file,
            block_size,
            compression,
            data_block: BlockBuilder::new(),
            index: Vec::new(),
            filter_keys: Vec::new(),
            last_key: None,
            smallest: None,
            largest: None,
            num_entries: 0,
            num_data_blocks: 0,
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn num_data_blocks(&self) -> usize {
        self.num_data_blocks + usize::from(!self.data_block.is_empty())
    }

    pub fn smallest(&self) -> Option<&InternalKey> {
        self.smallest.as_ref()
    }

    pub fn largest(&self) -> Option<&InternalKey> {
        self.largest.as_ref()
    }

    /// Estimated bytes written so far, for output-size cuts.
    pub fn estimated_size(&self) -> u64 {
        self.file.used_size() + self.data_block.size() as u64
    }

    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(Error::InvalidRequest(format!(
                    "keys added out of order at sequence {}",
                    key.sequence()
                )));
            }
        }
        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.largest = Some(key.clone());
        self.last_key = Some(key.clone());

        self.data_block.add(&key.encode_to_bytes(), value);
        self.filter_keys.push(Bytes::copy_from_slice(key.user_key()));
        self.num_entries += 1;

        if self.data_block.size() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let last_key = self
            .last_key
            .as_ref()
            .expect("non-empty block implies a key")
            .encode_to_bytes();
        let contents = self.data_block.finish();
        let sealed = seal_block(&contents, self.compression);
        let offset = self.file.used_size();
        self.file.append(&sealed)?;
        self.index.push((
            last_key,
            BlockHandle::new(offset, (sealed.len() - BLOCK_TRAILER_SIZE) as u64),
        ));
        self.num_data_blocks += 1;
        Ok(())
    }

    /// Write filter, metaindex, index, and footer; the file is then ready
    /// for `fsync()`.
    pub fn finish(&mut self) -> Result<()> {
        self.flush_data_block()?;
        if self.num_data_blocks == 0 {
            return Err(Error::InvalidRequest("table has no entries".to_string()));
        }

        // Filter block. Never compressed: bloom bits are high-entropy.
        let filter = BloomFilter::build(&self.filter_keys, FILTER_BITS_PER_KEY);
        let sealed = seal_block(&filter.encode(), Compression::None);
        let filter_handle = BlockHandle::new(
            self.file.used_size(),
            (sealed.len() - BLOCK_TRAILER_SIZE) as u64,
        );
        self.file.append(&sealed)?;

        // Metaindex block mapping the filter name to its location.
        let mut metaindex = BlockBuilder::new();
        let mut handle_buf = bytes::BytesMut::new();
        filter_handle.encode(&mut handle_buf);
        metaindex.add(FILTER_KEY.as_bytes(), &handle_buf);
        let sealed = seal_block(&metaindex.finish(), Compression::None);
        let metaindex_handle = BlockHandle::new(
            self.file.used_size(),
            (sealed.len() - BLOCK_TRAILER_SIZE) as u64,
        );
        self.file.append(&sealed)?;

        // Index block: last key of each data block -> its handle.
        let mut index_block = BlockBuilder::new();
        for (key, handle) in &self.index {
            let mut value = bytes::BytesMut::new();
            handle.encode(&mut value);
            index_block.add(key, &value);
        }
        let sealed = seal_block(&index_block.finish(), Compression::None);
        let index_handle = BlockHandle::new(
            self.file.used_size(),
            (sealed.len() - BLOCK_TRAILER_SIZE) as u64,
        );
        self.file.append(&sealed)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.file.append(&footer.encode_to_bytes())?;
        self.file.set_num_data_blocks(self.num_data_blocks);
        Ok(())
    }
}
