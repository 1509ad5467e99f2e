//! Coordinator-Side Database
//!
//! `Db` ties one database's version state to the table lifecycle: flushes
//! build and scatter L0 tables, reads resolve through them, and compaction
//! batches are shipped to a StoC and installed on return.
//!
//! Compaction workers never hold a `Db` pointer. They hold a `DbHandle` — a
//! weak, epoch-stamped capability that must be re-validated at dispatch, so
//! a database torn down or migrated between trigger and dispatch is skipped
//! instead of touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::Notify;
use tracing::{debug, info};

use blockhouse_cluster::ClusterConfig;
use blockhouse_core::block::Compression;
use blockhouse_core::key::ValueKind;
use blockhouse_core::{
    CompactionRequest, Error, FileMetaData, InternalKey, Result, SubRange, VersionEdit,
};
use blockhouse_table::filename::table_file_name;
use blockhouse_table::{
    BlockClient, MemManager, ScatterFile, StorageSelector, Table, TableBuilder,
};

use crate::versions::VersionSet;

/// Stable database name; survives migration between owners.
pub fn db_name(dbid: u32) -> String {
    format!("db-{dbid}")
}

#[derive(Debug, Clone, Copy)]
pub struct CompactionTask {
    pub dbid: u32,
    pub source_level: u32,
}

/// The capability surface a compaction worker sees.
#[async_trait]
pub trait CompactionDb: Send + Sync {
    fn dbid(&self) -> u32;
    fn epoch_id(&self) -> u32;
    async fn perform_compaction(&self, tasks: &[CompactionTask]) -> Result<()>;
}

/// Weak, epoch-stamped reference to a database.
#[derive(Clone)]
pub struct DbHandle {
    pub dbid: u32,
    pub epoch_id: u32,
    db: Weak<dyn CompactionDb>,
}

impl DbHandle {
    pub fn new(db: &Arc<Db>) -> Self {
        Self::for_db(db)
    }

    /// Build a handle for any database implementation (test doubles
    /// included). Holds only a weak reference.
    pub fn for_db<T: CompactionDb + 'static>(db: &Arc<T>) -> Self {
        let dyn_db: Arc<dyn CompactionDb> = Arc::clone(db) as Arc<dyn CompactionDb>;
        Self {
            dbid: dyn_db.dbid(),
            epoch_id: dyn_db.epoch_id(),
            db: Arc::downgrade(&dyn_db),
        }
    }

    /// Upgrade for dispatch; `None` when the database is gone or the
    /// cluster has moved past its epoch.
    pub fn acquire(&self, current_epoch: u32) -> Option<Arc<dyn CompactionDb>> {
        if self.epoch_id != current_epoch {
            return None;
        }
        self.db.upgrade()
    }
}

/// One memtable partition's coordinator-side bookkeeping. The memtable
/// bytes themselves live in the (external) write path; migration only moves
/// ids and log-file references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemTablePartition {
    pub partition_id: u32,
    pub active_memtable: Option<u32>,
    pub closed_log_files: Vec<u32>,
    pub immutable: bool,
}

pub struct Db {
    pub dbid: u32,
    pub epoch_id: u32,
    pub dbname: String,
    config: Arc<ClusterConfig>,
    client: BlockClient,
    mem: Arc<MemManager>,
    pub versions: Mutex<VersionSet>,
    lookup_index: Mutex<HashMap<Bytes, u32>>,
    partitions: Mutex<Vec<MemTablePartition>>,
    subranges: Mutex<Vec<SubRange>>,
    ready: AtomicBool,
    ready_signal: Notify,
}

impl Db {
    pub fn new(
        dbid: u32,
        epoch_id: u32,
        config: Arc<ClusterConfig>,
        client: BlockClient,
        mem: Arc<MemManager>,
        initially_ready: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            dbid,
            epoch_id,
            dbname: db_name(dbid),
            config,
            client,
            mem,
            versions: Mutex::new(VersionSet::new()),
            lookup_index: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
            subranges: Mutex::new(Vec::new()),
            ready: AtomicBool::new(initially_ready),
            ready_signal: Notify::new(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flip the fragment ready and wake every waiter.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.ready_signal.notify_waiters();
        info!(db = self.dbid, "fragment ready");
    }

    pub async fn wait_ready(&self) {
        while !self.is_ready() {
            let notified = self.ready_signal.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.versions.lock().unwrap().last_sequence()
    }

    // ------------------------------------------------------------------
    // Migration bookkeeping accessors
    // ------------------------------------------------------------------

    pub fn subranges(&self) -> Vec<SubRange> {
        self.subranges.lock().unwrap().clone()
    }

    pub fn set_subranges(&self, srs: Vec<SubRange>) {
        *self.subranges.lock().unwrap() = srs;
    }

    pub fn partitions(&self) -> Vec<MemTablePartition> {
        self.partitions.lock().unwrap().clone()
    }

    pub fn set_partitions(&self, parts: Vec<MemTablePartition>) {
        *self.partitions.lock().unwrap() = parts;
    }

    pub fn mark_partitions_immutable(&self) {
        for partition in self.partitions.lock().unwrap().iter_mut() {
            partition.immutable = true;
        }
    }

    pub fn lookup_index(&self) -> Vec<(Bytes, u32)> {
        let mut entries: Vec<(Bytes, u32)> = self
            .lookup_index
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }

    pub fn set_lookup_index(&self, entries: Vec<(Bytes, u32)>) {
        *self.lookup_index.lock().unwrap() = entries.into_iter().collect();
    }

    pub fn lookup_memtable(&self, key: &[u8]) -> Option<u32> {
        self.lookup_index.lock().unwrap().get(key).copied()
    }

    // ------------------------------------------------------------------
    // Flush and read
    // ------------------------------------------------------------------

    /// Build, scatter, and install one L0 table from a sorted run of
    /// entries (a flushed memtable). Returns the installed metadata.
    pub async fn flush_memtable(
        &self,
        memtable_id: u32,
        entries: &[(InternalKey, Bytes)],
        flush_timestamp: u64,
    ) -> Result<FileMetaData> {
        if !self.is_ready() {
            return Err(Error::InvalidRequest(format!(
                "db {} is not ready for writes",
                self.dbid
            )));
        }
        if entries.is_empty() {
            return Err(Error::InvalidRequest("flush of empty memtable".to_string()));
        }
        let number = self.versions.lock().unwrap().new_file_number();
        let payload: u64 = entries
            .iter()
            .map(|(k, v)| (k.user_key().len() + v.len() + 64) as u64)
            .sum();
        let buffer_size = (payload * 2 + (64 << 10)).max(self.config.options.sstable_size);

        let mut file = ScatterFile::new(
            Arc::clone(&self.mem),
            self.client.clone(),
            Arc::clone(&self.config),
            &self.dbname,
            number,
            memtable_id as u64,
            buffer_size,
            number,
        )?;
        let (smallest, largest) = {
            let mut builder = TableBuilder::new(
                &mut file,
                self.config.options.block_size,
                Compression::Lz4,
            );
            for (key, value) in entries {
                builder.add(key, value)?;
            }
            builder.finish()?;
            (
                builder.smallest().cloned().expect("non-empty flush"),
                builder.largest().cloned().expect("non-empty flush"),
            )
        };
        file.fsync()?;
        file.wait_for_persisting_data_blocks().await;
        let result = file.finalize().await?;

        let max_sequence = entries.iter().map(|(k, _)| k.sequence()).max().unwrap_or(0);
        let meta = FileMetaData {
            number,
            memtable_id,
            file_size: result.file_size,
            converted_file_size: result.converted_file_size,
            flush_timestamp,
            smallest,
            largest,
            meta_block_handle: result.meta_block_handle,
            data_block_group_handles: result.data_block_group_handles,
        };
        let mut edit = VersionEdit::new();
        edit.add_file(0, meta.clone());
        edit.set_last_sequence(max_sequence);
        {
            let mut versions = self.versions.lock().unwrap();
            versions.apply(&edit);
        }
        debug!(
            db = self.dbid,
            number,
            groups = meta.data_block_group_handles.len(),
            "memtable flushed to L0"
        );
        Ok(meta)
    }

    /// Outer `None`: key absent from this table. Inner `None`: the newest
    /// visible entry is a deletion.
    async fn search_table(
        &self,
        meta: &FileMetaData,
        user_key: &[u8],
        snapshot: u64,
    ) -> Result<Option<Option<Bytes>>> {
        let table = Table::open(
            meta.clone(),
            &self.dbname,
            self.client.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.mem),
            0,
            false,
            None,
        )
        .await?;
        match table.get(user_key, snapshot).await? {
            Some((key, _)) if key.kind() == ValueKind::Deletion => Ok(Some(None)),
            Some((_, value)) => Ok(Some(Some(value))),
            None => Ok(None),
        }
    }

    /// Read through the LSM: L0 newest-first, then each lower level.
    /// Deletions read as absent.
    pub async fn get(&self, user_key: &[u8]) -> Result<Option<Bytes>> {
        let snapshot = self.last_sequence();
        let (mut l0, lower): (Vec<FileMetaData>, Vec<Vec<FileMetaData>>) = {
            let versions = self.versions.lock().unwrap();
            let l0 = versions
                .overlapping_files(0, user_key, user_key);
            let lower = (1..crate::versions::NUM_LEVELS as u32)
                .map(|level| versions.overlapping_files(level, user_key, user_key))
                .collect();
            (l0, lower)
        };
        // Newer L0 tables shadow older ones.
        l0.sort_by(|a, b| b.number.cmp(&a.number));
        for meta in &l0 {
            if let Some(found) = self.search_table(meta, user_key, snapshot).await? {
                return Ok(found);
            }
        }
        for level_files in &lower {
            for meta in level_files {
                if let Some(found) = self.search_table(meta, user_key, snapshot).await? {
                    return Ok(found);
                }
            }
        }
        Ok(None)
    }

    /// Remove the local metadata files of dropped tables; remote bytes are
    /// deleted best-effort by the caller.
    fn remove_local_meta(&self, numbers: &[u64]) {
        for number in numbers {
            let path = table_file_name(&self.config.options.db_path, &self.dbname, *number);
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl CompactionDb for Db {
    fn dbid(&self) -> u32 {
        self.dbid
    }

    fn epoch_id(&self) -> u32 {
        self.epoch_id
    }

    /// Coalesced compaction pass: the scheduler guarantees one caller per
    /// database at a time.
    async fn perform_compaction(&self, tasks: &[CompactionTask]) -> Result<()> {
        let source_level = tasks.iter().map(|t| t.source_level).min().unwrap_or(0);
        let target_level = source_level + 1;

        let request = {
            let versions = self.versions.lock().unwrap();
            let inputs0 = versions.files(source_level).to_vec();
            if inputs0.is_empty() {
                debug!(db = self.dbid, source_level, "nothing to compact");
                return Ok(());
            }
            let smallest = inputs0
                .iter()
                .map(|f| f.smallest.user_key())
                .min()
                .expect("non-empty inputs")
                .to_vec();
            let largest = inputs0
                .iter()
                .map(|f| f.largest.user_key())
                .max()
                .expect("non-empty inputs")
                .to_vec();
            let inputs1 = versions.overlapping_files(target_level, &smallest, &largest);
            let guides = versions.overlapping_files(target_level + 1, &smallest, &largest);
            CompactionRequest {
                dbname: self.dbname.clone(),
                source_level,
                target_level,
                smallest_snapshot: versions.last_sequence(),
                inputs: [inputs0, inputs1],
                guides,
                subranges: self.subranges(),
            }
        };

        let selector = StorageSelector::new(&self.client, &self.config);
        let mut rng = SmallRng::seed_from_u64(self.dbid as u64 ^ request.smallest_snapshot);
        let stoc = selector.select_storage_servers(
            &mut rng,
            self.config.options.scatter_policy,
            1,
        )?[0];
        info!(
            db = self.dbid,
            stoc,
            source_level,
            inputs = request.inputs[0].len() + request.inputs[1].len(),
            "submitting compaction"
        );

        let req_id = self.client.initiate_compaction(stoc, request.clone())?;
        let edit = self
            .client
            .wait_for(req_id)
            .await?
            .edit
            .ok_or_else(|| Error::corruption("compaction response without edit"))?;

        // Route best-effort deletions by the segments each table occupied.
        let mut deletions: HashMap<u32, Vec<u64>> = HashMap::new();
        let deleted_numbers: Vec<u64> = {
            let versions = self.versions.lock().unwrap();
            edit.deleted_files
                .iter()
                .map(|(_, d)| {
                    if let Some(handles) = versions.table_handles(d.fnumber) {
                        for handle in handles {
                            deletions
                                .entry(handle.server_id)
                                .or_default()
                                .push(d.fnumber);
                        }
                    }
                    d.fnumber
                })
                .collect()
        };
        self.versions.lock().unwrap().apply(&edit);

        for (server, mut numbers) in deletions {
            numbers.sort_unstable();
            numbers.dedup();
            self.client.initiate_delete_tables(server, &self.dbname, numbers);
        }
        self.remove_local_meta(&deleted_numbers);
        info!(
            db = self.dbid,
            added = edit.new_files.len(),
            dropped = deleted_numbers.len(),
            "compaction installed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dbid", &self.dbid)
            .field("epoch_id", &self.epoch_id)
            .field("ready", &self.is_ready())
            .finish()
    }
}
