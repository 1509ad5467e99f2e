//! Scatter Writer
//!
//! An SSTable is assembled in a pinned buffer on the LTC, then scattered:
//!
//! 1. `fsync()` decodes the trailing footer and the index block, partitions
//!    the data blocks into `G` contiguous, key-ordered groups, asks the
//!    `StorageSelector` for `G` distinct StoCs, and issues one append per
//!    group straight out of the build buffer.
//! 2. `wait_for_persisting_data_blocks()` waits for the `G` completions.
//! 3. `finalize()` harvests the group handles, rewrites the index block so
//!    every data-block offset points into its owning StoC segment, rebuilds
//!    the contiguous metadata blob (filter, metaindex, index, footer) in
//!    place after the last data block, writes the blob to the local `.ldb`
//!    file, and persists it to one randomly chosen StoC as the meta handle.
//!
//! The build buffer belongs to the writing thread for the whole
//! build → scatter → finalize lifecycle and goes back to the slab pool when
//! the file is released. A failed scatter append aborts the table: nothing
//! is published and the orphaned remote bytes wait for garbage collection.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use blockhouse_cluster::ClusterConfig;
use blockhouse_core::block::{
    seal_block, BlockBuilder, Compression, Footer, BLOCK_TRAILER_SIZE, FOOTER_SIZE,
};
use blockhouse_core::{block, BlockHandle, Error, Result, StoCBlockHandle};

use crate::client::BlockClient;
use crate::filename::table_file_name;
use crate::mem_manager::{MemManager, PinnedBuf};
use crate::selector::StorageSelector;

/// Name under which the filter block is registered in the metaindex.
pub const FILTER_KEY: &str = "filter.blockhouse.Bloom";

/// Split `num_data_blocks` into `min(scatter_width, num_data_blocks)`
/// contiguous groups, sized as evenly as possible; the first
/// `num_data_blocks % groups` get one extra block. Key order is preserved:
/// every key in group k sorts before every key in group k+1.
pub fn partition_into_groups(num_data_blocks: usize, scatter_width: usize) -> Vec<usize> {
    if num_data_blocks == 0 {
        return Vec::new();
    }
    if num_data_blocks < scatter_width {
        return vec![1; num_data_blocks];
    }
    let groups = scatter_width.max(1);
    let base = num_data_blocks / groups;
    let remainder = num_data_blocks % groups;
    (0..groups)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct PersistStatus {
    remote_server_id: u32,
    write_req_id: u32,
    result_handle: StoCBlockHandle,
}

/// Everything the version edit needs from a finalized table.
#[derive(Debug, Clone)]
pub struct ScatterResult {
    pub file_size: u64,
    pub converted_file_size: u64,
    pub meta_block_handle: StoCBlockHandle,
    pub data_block_group_handles: Vec<StoCBlockHandle>,
}

pub struct ScatterFile {
    mem: Arc<MemManager>,
    buf: Option<PinnedBuf>,
    thread_id: u64,
    allocated_size: u64,
    used_size: u64,
    dbname: String,
    file_number: u64,
    client: BlockClient,
    config: Arc<ClusterConfig>,
    rng: SmallRng,
    num_data_blocks: usize,
    nblocks_in_group: Vec<usize>,
    statuses: Vec<PersistStatus>,
    index_entries: Vec<(Bytes, BlockHandle)>,
}

impl ScatterFile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mem: Arc<MemManager>,
        client: BlockClient,
        config: Arc<ClusterConfig>,
        dbname: &str,
        file_number: u64,
        thread_id: u64,
        file_size: u64,
        rand_seed: u64,
    ) -> Result<Self> {
        let buf = mem.alloc_for(thread_id, file_size)?;
        debug!(dbname, file_number, file_size, "building sstable in pinned buffer");
        Ok(Self {
            mem,
            allocated_size: buf.len() as u64,
            buf: Some(buf),
            thread_id,
            used_size: 0,
            dbname: dbname.to_string(),
            file_number,
            client,
            config,
            rng: SmallRng::seed_from_u64(rand_seed ^ file_number),
            num_data_blocks: 0,
            nblocks_in_group: Vec::new(),
            statuses: Vec::new(),
            index_entries: Vec::new(),
        })
    }

    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    pub fn set_num_data_blocks(&mut self, n: usize) {
        self.num_data_blocks = n;
    }

    fn buf(&self) -> &PinnedBuf {
        self.buf.as_ref().expect("buffer released")
    }

    fn buf_mut(&mut self) -> &mut PinnedBuf {
        self.buf.as_mut().expect("buffer released")
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let offset = self.used_size;
        self.write_at(offset, data)
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.allocated_size {
            return Err(Error::InvalidRequest(format!(
                "table {} overflows its build buffer ({end} > {})",
                self.file_number, self.allocated_size
            )));
        }
        self.buf_mut().as_mut_slice()[offset as usize..end as usize].copy_from_slice(data);
        if end > self.used_size {
            self.used_size = end;
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, n: u64) -> &[u8] {
        let end = (offset + n).min(self.used_size);
        &self.buf().as_slice()[offset as usize..end as usize]
    }

    /// The table is fully in the buffer: scatter its data-block groups.
    pub fn fsync(&mut self) -> Result<()> {
        self.format()
    }

    fn format(&mut self) -> Result<()> {
        let used = self.used_size as usize;
        let footer = Footer::decode(&self.buf().as_slice()[..used])?;

        // Decode the index block to enumerate data-block positions.
        let index_end = footer.index_handle.offset as usize
            + footer.index_handle.size as usize
            + BLOCK_TRAILER_SIZE;
        if index_end > used {
            return Err(Error::corruption("index handle out of range"));
        }
        let sealed = &self.buf().as_slice()[footer.index_handle.offset as usize..index_end];
        let contents = block::open_block(sealed)?;
        let mut entries = Vec::new();
        for (key, mut value) in block::parse_entries(contents)? {
            entries.push((key, BlockHandle::decode(&mut value)?));
        }
        if entries.len() != self.num_data_blocks {
            return Err(Error::corruption(format!(
                "index lists {} blocks, builder reported {}",
                entries.len(),
                self.num_data_blocks
            )));
        }

        self.nblocks_in_group = partition_into_groups(
            self.num_data_blocks,
            self.config.options.num_stocs_scatter_data_blocks,
        );
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let selector = StorageSelector::new(&client, &config);
        let scatter_stocs = selector.select_storage_servers(
            &mut self.rng,
            config.options.scatter_policy,
            self.nblocks_in_group.len(),
        )?;

        let mut group_id = 0;
        let mut n = 0usize;
        let mut group_offset = 0u64;
        let mut group_size = 0u64;
        for (_, handle) in &entries {
            let physical = handle.size + BLOCK_TRAILER_SIZE as u64;
            if n == 0 {
                group_offset = handle.offset;
            } else if group_offset + group_size != handle.offset {
                return Err(Error::corruption("data blocks are not contiguous"));
            }
            group_size += physical;
            n += 1;
            if n == self.nblocks_in_group[group_id] {
                let stoc = scatter_stocs[group_id];
                let payload = Bytes::copy_from_slice(
                    &self.buf().as_slice()
                        [group_offset as usize..(group_offset + group_size) as usize],
                );
                let req_id = self
                    .client
                    .initiate_append_block(stoc, &self.dbname, self.file_number, payload, false)
                    .map_err(|e| Error::ScatterFailed {
                        server_id: stoc,
                        reason: e.to_string(),
                    })?;
                debug!(
                    group = group_id,
                    stoc,
                    req_id,
                    bytes = group_size,
                    file = self.file_number,
                    "scattering data block group"
                );
                self.statuses.push(PersistStatus {
                    remote_server_id: stoc,
                    write_req_id: req_id,
                    result_handle: StoCBlockHandle::default(),
                });
                group_id += 1;
                n = 0;
                group_size = 0;
            }
        }
        debug_assert_eq!(group_id, self.nblocks_in_group.len());
        self.index_entries = entries;
        Ok(())
    }

    /// One wait per scatter group; completion order is unspecified.
    pub async fn wait_for_persisting_data_blocks(&self) {
        for _ in 0..self.statuses.len() {
            self.client.wait().await;
        }
    }

    /// Harvest group handles, rewrite the metadata blob, persist it.
    pub async fn finalize(&mut self) -> Result<ScatterResult> {
        if self.statuses.is_empty() {
            return Err(Error::InvalidRequest(
                "finalize before fsync: no scattered groups".to_string(),
            ));
        }
        for i in 0..self.statuses.len() {
            let status = self.statuses[i];
            let response = self
                .client
                .wait_for(status.write_req_id)
                .await
                .map_err(|e| Error::ScatterFailed {
                    server_id: status.remote_server_id,
                    reason: e.to_string(),
                })?;
            let handle = *response
                .handles
                .first()
                .ok_or_else(|| Error::corruption("append response without handle"))?;
            self.statuses[i].result_handle = handle;
        }

        let used = self.used_size as usize;
        let footer = Footer::decode(&self.buf().as_slice()[..used])?;

        // Translate every index entry into its owning StoC segment.
        let mut new_index = BlockBuilder::new();
        let mut group_id = 0;
        let mut n = 0usize;
        let mut relative_offset = 0u64;
        let mut current = self.statuses[0].result_handle;
        let mut filter_block_start = 0u64;
        for (key, handle) in &self.index_entries {
            if n == 0 {
                relative_offset = handle.offset;
            }
            filter_block_start = handle.offset + handle.size + BLOCK_TRAILER_SIZE as u64;
            let translated = StoCBlockHandle {
                server_id: current.server_id,
                stoc_file_id: current.stoc_file_id,
                offset: current.offset + (handle.offset - relative_offset),
                size: handle.size,
            };
            new_index.add(key, &translated.encode_to_bytes());
            n += 1;
            if n == self.nblocks_in_group[group_id] {
                let group_end =
                    translated.offset + translated.size + BLOCK_TRAILER_SIZE as u64;
                if current.offset + current.size != group_end {
                    return Err(Error::corruption(format!(
                        "group {group_id} handle does not cover its blocks"
                    )));
                }
                group_id += 1;
                n = 0;
                if group_id < self.statuses.len() {
                    current = self.statuses[group_id].result_handle;
                }
            }
        }

        // The filter block sits between the last data block and the old
        // metaindex; it stays in place and becomes byte 0 of the blob.
        let filter_size =
            footer.metaindex_handle.offset - filter_block_start - BLOCK_TRAILER_SIZE as u64;
        let rewrite_start = filter_block_start;
        let mut blob_len = filter_size + BLOCK_TRAILER_SIZE as u64;

        let mut metaindex = BlockBuilder::new();
        let mut filter_handle_buf = bytes::BytesMut::new();
        BlockHandle::new(0, filter_size).encode(&mut filter_handle_buf);
        metaindex.add(FILTER_KEY.as_bytes(), &filter_handle_buf);
        let sealed = seal_block(&metaindex.finish(), Compression::None);
        self.write_at(rewrite_start + blob_len, &sealed)?;
        let metaindex_handle = BlockHandle::new(blob_len, (sealed.len() - BLOCK_TRAILER_SIZE) as u64);
        blob_len += sealed.len() as u64;

        let sealed = seal_block(&new_index.finish(), Compression::None);
        self.write_at(rewrite_start + blob_len, &sealed)?;
        let index_handle = BlockHandle::new(blob_len, (sealed.len() - BLOCK_TRAILER_SIZE) as u64);
        blob_len += sealed.len() as u64;

        let new_footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.write_at(rewrite_start + blob_len, &new_footer.encode_to_bytes())?;
        blob_len += FOOTER_SIZE as u64;

        // Local metadata SSTable, so readers can open the table without a
        // remote fetch for pointer chasing.
        let blob = Bytes::copy_from_slice(
            &self.buf().as_slice()[rewrite_start as usize..(rewrite_start + blob_len) as usize],
        );
        let path = table_file_name(&self.config.options.db_path, &self.dbname, self.file_number);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&blob).await?;
        file.sync_all().await?;

        // Persist the blob to one randomly chosen StoC.
        let candidates: Vec<u32> = self
            .config
            .options
            .stoc_servers
            .iter()
            .copied()
            .filter(|&s| !self.client.is_failed(s))
            .collect();
        if candidates.is_empty() {
            return Err(Error::InvalidRequest("no live StoC for meta blob".to_string()));
        }
        let stoc = candidates[self.rng.gen_range(0..candidates.len())];
        let req_id = self
            .client
            .initiate_append_block(stoc, &self.dbname, self.file_number, blob, true)
            .map_err(|e| Error::ScatterFailed {
                server_id: stoc,
                reason: e.to_string(),
            })?;
        let response = self
            .client
            .wait_for(req_id)
            .await
            .map_err(|e| Error::ScatterFailed {
                server_id: stoc,
                reason: e.to_string(),
            })?;
        let meta_block_handle = *response
            .handles
            .first()
            .ok_or_else(|| Error::corruption("meta append response without handle"))?;
        debug!(
            file = self.file_number,
            meta_stoc = stoc,
            blob_len,
            "sstable finalized"
        );

        Ok(ScatterResult {
            file_size: self.used_size,
            converted_file_size: blob_len,
            meta_block_handle,
            data_block_group_handles: self
                .statuses
                .iter()
                .map(|s| s.result_handle)
                .collect(),
        })
    }

    /// Return the pinned buffer to the slab pool.
    pub fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.mem.free(self.thread_id, buf);
        }
    }
}

impl Drop for ScatterFile {
    fn drop(&mut self) {
        self.release();
    }
}
