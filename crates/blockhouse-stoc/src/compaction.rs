//! Remote Compaction Executor
//!
//! A compaction job arrives fully described: the input files of both
//! levels, guide files one level past the target (output split bounds), the
//! subrange layout, and the smallest live snapshot. The executor opens the
//! inputs through the normal table reader (fetching any missing metadata
//! blobs in parallel), merges them newest-first, and writes the outputs
//! through the same builder/scatter path the LTC flush uses — so compaction
//! outputs are scattered tables like any other.
//!
//! Output file numbers are minted as `(node_id << 32) | seq`, keeping the
//! number space disjoint from every other node without coordination.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{debug, info};

use blockhouse_cluster::ClusterConfig;
use blockhouse_core::block::Compression;
use blockhouse_core::{
    CompactionRequest, Error, FileMetaData, InternalKey, Result, VersionEdit,
};
use blockhouse_table::{
    BlockClient, LocalBlockReader, MemManager, ScatterFile, Table, TableBuilder,
};

use crate::segment::StocFileManager;

pub struct CompactionExecutor {
    config: Arc<ClusterConfig>,
    client: BlockClient,
    mem: Arc<MemManager>,
    manager: Arc<StocFileManager>,
    next_seq: AtomicU32,
}

impl CompactionExecutor {
    pub fn new(
        config: Arc<ClusterConfig>,
        client: BlockClient,
        mem: Arc<MemManager>,
        manager: Arc<StocFileManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            mem,
            manager,
            next_seq: AtomicU32::new(1),
        })
    }

    fn next_file_number(&self) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) as u64;
        ((self.manager.server_id() as u64) << 32) | seq
    }

    /// Open every input table, fetching missing metadata files in parallel.
    async fn open_inputs(&self, request: &CompactionRequest) -> Result<Vec<Table>> {
        let mut join = JoinSet::new();
        for meta in request.inputs[0].iter().chain(request.inputs[1].iter()) {
            let meta = meta.clone();
            let dbname = request.dbname.clone();
            let client = self.client.clone();
            let config = Arc::clone(&self.config);
            let mem = Arc::clone(&self.mem);
            let local = Arc::clone(&self.manager) as Arc<dyn LocalBlockReader>;
            join.spawn(async move {
                Table::open(meta, &dbname, client, config, mem, 0, false, Some(local)).await
            });
        }
        let mut tables = Vec::new();
        while let Some(joined) = join.join_next().await {
            tables.push(joined.map_err(|e| Error::InvalidRequest(e.to_string()))??);
        }
        Ok(tables)
    }

    pub async fn execute(&self, request: &CompactionRequest) -> Result<VersionEdit> {
        info!(
            db = %request.dbname,
            source = request.source_level,
            target = request.target_level,
            inputs = request.inputs[0].len() + request.inputs[1].len(),
            "compaction started"
        );
        let tables = self.open_inputs(request).await?;

        // Merge: one big internal-key sort, newest version of each user key
        // first.
        let mut entries: Vec<(InternalKey, Bytes)> = Vec::new();
        for table in &tables {
            entries.extend(table.iter_all().await?);
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let survivors = drop_shadowed(entries, request.smallest_snapshot);

        // Cut outputs at the size target and at guide boundaries so the
        // level above the target stays cheap to compact later.
        let mut edit = VersionEdit::new();
        let mut guide_idx = 0usize;
        let mut chunk: Vec<(InternalKey, Bytes)> = Vec::new();
        let mut chunk_bytes = 0u64;
        for (key, value) in survivors {
            let crosses_guide = loop {
                match request.guides.get(guide_idx) {
                    Some(guide) if guide.largest.user_key() < key.user_key() => {
                        guide_idx += 1;
                        break true;
                    }
                    _ => break false,
                }
            };
            if !chunk.is_empty()
                && (chunk_bytes >= self.config.options.sstable_size || crosses_guide)
            {
                self.write_output(request, &mut edit, std::mem::take(&mut chunk))
                    .await?;
                chunk_bytes = 0;
            }
            chunk_bytes += (key.user_key().len() + value.len() + 32) as u64;
            chunk.push((key, value));
        }
        if !chunk.is_empty() {
            self.write_output(request, &mut edit, chunk).await?;
        }

        for meta in &request.inputs[0] {
            edit.delete_file(request.source_level, meta.memtable_id, meta.number);
        }
        for meta in &request.inputs[1] {
            edit.delete_file(request.target_level, meta.memtable_id, meta.number);
        }
        info!(
            db = %request.dbname,
            outputs = edit.new_files.len(),
            deleted = edit.deleted_files.len(),
            "compaction finished"
        );
        Ok(edit)
    }

    async fn write_output(
        &self,
        request: &CompactionRequest,
        edit: &mut VersionEdit,
        chunk: Vec<(InternalKey, Bytes)>,
    ) -> Result<()> {
        let number = self.next_file_number();
        let buffer_size = (self.config.options.sstable_size * 2).max(1 << 20);
        let mut file = ScatterFile::new(
            Arc::clone(&self.mem),
            self.client.clone(),
            Arc::clone(&self.config),
            &request.dbname,
            number,
            0,
            buffer_size,
            number,
        )?;
        let (smallest, largest) = {
            let mut builder = TableBuilder::new(
                &mut file,
                self.config.options.block_size,
                Compression::Lz4,
            );
            for (key, value) in &chunk {
                builder.add(key, value)?;
            }
            builder.finish()?;
            (
                builder.smallest().cloned().expect("non-empty output"),
                builder.largest().cloned().expect("non-empty output"),
            )
        };
        file.fsync()?;
        file.wait_for_persisting_data_blocks().await;
        let result = file.finalize().await?;
        debug!(number, entries = chunk.len(), "compaction output table");
        edit.add_file(
            request.target_level,
            FileMetaData {
                number,
                memtable_id: 0,
                file_size: result.file_size,
                converted_file_size: result.converted_file_size,
                flush_timestamp: 0,
                smallest,
                largest,
                meta_block_handle: result.meta_block_handle,
                data_block_group_handles: result.data_block_group_handles,
            },
        );
        Ok(())
    }
}

/// Keep, for each user key, the newest entry plus nothing hidden by a newer
/// entry already visible to the oldest snapshot. A deletion that is itself
/// at or below the snapshot floor is dropped outright.
fn drop_shadowed(
    entries: Vec<(InternalKey, Bytes)>,
    smallest_snapshot: u64,
) -> Vec<(InternalKey, Bytes)> {
    let mut out = Vec::with_capacity(entries.len());
    let mut current_key: Option<Bytes> = None;
    let mut last_kept_sequence = u64::MAX;
    for (key, value) in entries {
        let same_key = current_key
            .as_deref()
            .is_some_and(|prev| prev == key.user_key());
        if !same_key {
            current_key = Some(Bytes::copy_from_slice(key.user_key()));
            last_kept_sequence = u64::MAX;
        } else if last_kept_sequence <= smallest_snapshot {
            // A newer version is already visible to every snapshot.
            continue;
        }
        last_kept_sequence = key.sequence();
        if key.is_deletion() && key.sequence() <= smallest_snapshot {
            continue;
        }
        out.push((key, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockhouse_core::key::ValueKind;

    fn entry(user: &str, seq: u64, kind: ValueKind) -> (InternalKey, Bytes) {
        (
            InternalKey::new(Bytes::copy_from_slice(user.as_bytes()), seq, kind),
            Bytes::from(format!("v{seq}")),
        )
    }

    #[test]
    fn test_newest_version_wins() {
        let entries = vec![
            entry("a", 9, ValueKind::Value),
            entry("a", 5, ValueKind::Value),
            entry("b", 3, ValueKind::Value),
        ];
        let out = drop_shadowed(entries, 0);
        // Sequence 5 stays: no newer version is at or below snapshot 0.
        assert_eq!(out.len(), 3);
        let out = drop_shadowed(
            vec![entry("a", 9, ValueKind::Value), entry("a", 5, ValueKind::Value)],
            100,
        );
        // Snapshot 100 sees sequence 9, so 5 is shadowed.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.sequence(), 9);
    }

    #[test]
    fn test_old_tombstone_dropped() {
        let entries = vec![
            entry("gone", 4, ValueKind::Deletion),
            entry("gone", 2, ValueKind::Value),
        ];
        let out = drop_shadowed(entries, 100);
        assert!(out.is_empty());
    }

    #[test]
    fn test_recent_tombstone_kept() {
        let entries = vec![entry("gone", 50, ValueKind::Deletion)];
        let out = drop_shadowed(entries, 10);
        assert_eq!(out.len(), 1);
        assert!(out[0].0.is_deletion());
    }

    #[test]
    fn test_version_above_snapshot_preserved_for_readers() {
        // Snapshot 6 must still see sequence 5 even though 9 exists.
        let entries = vec![
            entry("a", 9, ValueKind::Value),
            entry("a", 5, ValueKind::Value),
            entry("a", 2, ValueKind::Value),
        ];
        let out = drop_shadowed(entries, 6);
        let seqs: Vec<u64> = out.iter().map(|(k, _)| k.sequence()).collect();
        // 9 kept (newest), 5 kept (visible at snapshot 6), 2 shadowed by 5.
        assert_eq!(seqs, vec![9, 5]);
    }
}
