//! Random-Access Reader
//!
//! `StocReadableFile` resolves a global block handle to bytes, two ways:
//!
//! - **Lazy**: one fabric read per block, waited on by request id. The
//!   landed buffer must end in a non-zero byte (the block trailer's
//!   sentinel); an all-zero tail means the one-sided write has not landed
//!   yet and the read re-polls instead of paying an ACK round trip.
//! - **Prefetch-all**: one pinned buffer sized to the table's data region,
//!   one parallel read per scatter group, then every block read is a local
//!   copy through a `(server, segment) -> base offset` map.
//!
//! Handles that resolve to this node bypass the fabric: `stoc_file_id == 0`
//! reads the local metadata file, and a handle owned by the local server
//! goes through the `LocalBlockReader` seam.
//!
//! `Table` sits on top: it parses the metadata blob (footer → index →
//! filter) out of the local `.ldb` file and serves point lookups and ordered
//! scans.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use blockhouse_cluster::ClusterConfig;
use blockhouse_core::block::{self, BLOCK_TRAILER_SIZE};
use blockhouse_core::{BlockHandle, Error, FileMetaData, InternalKey, Result, StoCBlockHandle};

use crate::bloom::BloomFilter;
use crate::client::{BlockClient, LocalBlockReader};
use crate::filename::{sstable_name, table_file_name};
use crate::mem_manager::{MemManager, PinnedBuf};

/// How many times a lazy read re-polls an unlanded buffer before giving up.
const MAX_READ_POLLS: usize = 100;

#[derive(Debug, Clone, Copy)]
struct GroupSpan {
    /// Offset of the group inside its StoC segment.
    offset: u64,
    /// Offset of the group inside the prefetch buffer.
    local_offset: u64,
    size: u64,
}

struct Prefetch {
    buf: PinnedBuf,
    spans: HashMap<u64, GroupSpan>,
}

pub struct StocReadableFile {
    dbname: String,
    meta: FileMetaData,
    client: BlockClient,
    config: Arc<ClusterConfig>,
    mem: Arc<MemManager>,
    thread_id: u64,
    local_path: PathBuf,
    local_reader: Option<Arc<dyn LocalBlockReader>>,
    prefetch: Option<Prefetch>,
}

impl StocReadableFile {
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        meta: FileMetaData,
        dbname: &str,
        client: BlockClient,
        config: Arc<ClusterConfig>,
        mem: Arc<MemManager>,
        thread_id: u64,
        prefetch_all: bool,
        local_reader: Option<Arc<dyn LocalBlockReader>>,
    ) -> Result<Self> {
        let local_path = table_file_name(&config.options.db_path, dbname, meta.number);
        let mut file = Self {
            dbname: dbname.to_string(),
            meta,
            client,
            config,
            mem,
            thread_id,
            local_path,
            local_reader,
            prefetch: None,
        };
        file.ensure_local_meta().await?;
        if prefetch_all {
            file.read_all().await?;
        }
        Ok(file)
    }

    pub fn meta(&self) -> &FileMetaData {
        &self.meta
    }

    /// Fetch the metadata blob into the local `.ldb` file if missing.
    async fn ensure_local_meta(&mut self) -> Result<()> {
        if tokio::fs::try_exists(&self.local_path).await? {
            return Ok(());
        }
        let handle = self.meta.meta_block_handle;
        debug!(
            file = self.meta.number,
            server = handle.server_id,
            "fetching metadata blob"
        );
        let blob = self
            .fetch_remote(&handle, handle.offset, handle.size)
            .await?;
        if let Some(parent) = self.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&self.local_path).await?;
        out.write_all(&blob).await?;
        out.sync_all().await?;
        Ok(())
    }

    /// Prefetch the whole data region: one read per scatter group, all in
    /// flight at once.
    async fn read_all(&mut self) -> Result<()> {
        let total = self.meta.data_region_size();
        let mut buf = self.mem.alloc_for(self.thread_id, total)?;
        let mut reqs = Vec::with_capacity(self.meta.data_block_group_handles.len());
        let mut spans = HashMap::new();
        let name = sstable_name(&self.dbname, self.meta.number);
        let mut local_offset = 0u64;
        for handle in &self.meta.data_block_group_handles {
            let req = self
                .client
                .initiate_read_data_block(handle, handle.offset, handle.size, &name)?;
            spans.insert(
                handle.segment_key(),
                GroupSpan {
                    offset: handle.offset,
                    local_offset,
                    size: handle.size,
                },
            );
            reqs.push((req, *handle, local_offset));
            local_offset += handle.size;
        }
        for _ in 0..reqs.len() {
            self.client.wait().await;
        }
        for (req, handle, local_offset) in reqs {
            let data = self
                .client
                .wait_for(req)
                .await?
                .data
                .ok_or_else(|| Error::corruption("group read without data"))?;
            if data.len() as u64 != handle.size || !block::is_write_complete(&data) {
                return Err(Error::corruption(format!(
                    "group read for table {} incomplete",
                    self.meta.number
                )));
            }
            buf.as_mut_slice()[local_offset as usize..(local_offset + handle.size) as usize]
                .copy_from_slice(&data);
        }
        self.prefetch = Some(Prefetch { buf, spans });
        Ok(())
    }

    async fn fetch_remote(
        &self,
        handle: &StoCBlockHandle,
        offset: u64,
        size: u64,
    ) -> Result<Bytes> {
        let name = sstable_name(&self.dbname, self.meta.number);
        for _ in 0..MAX_READ_POLLS {
            let req = self
                .client
                .initiate_read_data_block(handle, offset, size, &name)?;
            let data = self
                .client
                .wait_for(req)
                .await?
                .data
                .ok_or_else(|| Error::corruption("read response without data"))?;
            if data.len() as u64 == size && block::is_write_complete(&data) {
                return Ok(data);
            }
            // The remote write has not landed; poll again.
            tokio::task::yield_now().await;
        }
        Err(Error::transport(
            handle.server_id,
            "block never landed after polling",
        ))
    }

    fn read_local_file(&self, offset: u64, size: u64) -> Result<Bytes> {
        let mut file = std::fs::File::open(&self.local_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0u8; size as usize];
        file.read_exact(&mut out)?;
        Ok(Bytes::from(out))
    }

    /// Read `size` bytes at `offset` of the region addressed by `handle`.
    /// All-or-error: no partial reads.
    pub async fn read(
        &self,
        handle: &StoCBlockHandle,
        offset: u64,
        size: u64,
    ) -> Result<Bytes> {
        if handle.is_local() {
            return self.read_local_file(offset, size);
        }
        if let Some(prefetch) = &self.prefetch {
            let span = prefetch
                .spans
                .get(&handle.segment_key())
                .ok_or_else(|| Error::corruption("handle outside prefetched groups"))?;
            if offset < span.offset || offset + size > span.offset + span.size {
                return Err(Error::corruption("read outside its group span"));
            }
            let local = (span.local_offset + (offset - span.offset)) as usize;
            return Ok(Bytes::copy_from_slice(
                &prefetch.buf.as_slice()[local..local + size as usize],
            ));
        }
        if handle.server_id == self.client.my_server_id() {
            if let Some(local) = &self.local_reader {
                return local.read_local(handle, offset, size);
            }
        }
        self.fetch_remote(handle, offset, size).await
    }
}

impl Drop for StocReadableFile {
    fn drop(&mut self) {
        if let Some(prefetch) = self.prefetch.take() {
            self.mem.free(self.thread_id, prefetch.buf);
        }
    }
}

/// A readable SSTable: parsed index and filter over a `StocReadableFile`.
pub struct Table {
    file: StocReadableFile,
    index: Vec<(InternalKey, StoCBlockHandle)>,
    filter: BloomFilter,
}

impl Table {
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        meta: FileMetaData,
        dbname: &str,
        client: BlockClient,
        config: Arc<ClusterConfig>,
        mem: Arc<MemManager>,
        thread_id: u64,
        prefetch_all: bool,
        local_reader: Option<Arc<dyn LocalBlockReader>>,
    ) -> Result<Self> {
        let file = StocReadableFile::open(
            meta, dbname, client, config, mem, thread_id, prefetch_all, local_reader,
        )
        .await?;

        // The local blob is self-consistent: footer handles are relative to
        // byte 0 of the blob.
        let blob = file.read_local_file(0, file.meta.converted_file_size)?;
        let footer = block::Footer::decode(&blob)?;

        let index_sealed = slice_block(&blob, &footer.index_handle)?;
        let mut index = Vec::new();
        for (mut key, mut value) in block::parse_entries(block::open_block(index_sealed)?)? {
            index.push((
                InternalKey::decode(&mut key)?,
                StoCBlockHandle::decode(&mut value)?,
            ));
        }

        let metaindex_sealed = slice_block(&blob, &footer.metaindex_handle)?;
        let entries = block::parse_entries(block::open_block(metaindex_sealed)?)?;
        let (_, mut filter_value) = entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::corruption("metaindex has no filter entry"))?;
        let filter_handle = BlockHandle::decode(&mut filter_value)?;
        let filter_sealed = slice_block(&blob, &filter_handle)?;
        let filter = BloomFilter::decode(&block::open_block(filter_sealed)?)?;

        Ok(Self {
            file,
            index,
            filter,
        })
    }

    pub fn meta(&self) -> &FileMetaData {
        self.file.meta()
    }

    async fn read_block(&self, handle: &StoCBlockHandle) -> Result<Vec<(InternalKey, Bytes)>> {
        let sealed = self
            .file
            .read(handle, handle.offset, handle.size + BLOCK_TRAILER_SIZE as u64)
            .await?;
        let mut entries = Vec::new();
        for (mut key, value) in block::parse_entries(block::open_block(&sealed)?)? {
            entries.push((InternalKey::decode(&mut key)?, value));
        }
        Ok(entries)
    }

    /// Newest visible entry for `user_key` at `snapshot`. Deletions are
    /// returned as entries; the caller interprets the kind.
    pub async fn get(
        &self,
        user_key: &[u8],
        snapshot: u64,
    ) -> Result<Option<(InternalKey, Bytes)>> {
        if !self.filter.may_contain(user_key) {
            return Ok(None);
        }
        // First block whose largest key is >= the lookup key.
        let idx = self
            .index
            .partition_point(|(last_key, _)| last_key.user_key() < user_key);
        let Some((_, handle)) = self.index.get(idx) else {
            return Ok(None);
        };
        let entries = self.read_block(handle).await?;
        Ok(entries
            .into_iter()
            .find(|(key, _)| key.user_key() == user_key && key.sequence() <= snapshot))
    }

    /// Every entry of the table in internal-key order.
    pub async fn iter_all(&self) -> Result<Vec<(InternalKey, Bytes)>> {
        let mut all = Vec::new();
        for (_, handle) in &self.index {
            all.extend(self.read_block(handle).await?);
        }
        Ok(all)
    }
}

fn slice_block<'a>(blob: &'a [u8], handle: &BlockHandle) -> Result<&'a [u8]> {
    let end = handle.offset as usize + handle.size as usize + BLOCK_TRAILER_SIZE;
    if end > blob.len() {
        return Err(Error::corruption("block handle out of blob range"));
    }
    Ok(&blob[handle.offset as usize..end])
}
