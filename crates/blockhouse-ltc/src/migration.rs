//! Migration / Handoff
//!
//! When the cluster configuration advances, a database moves between LTCs
//! as one encoded image: version state, subranges, memtable partition
//! layout, the lookup index, and the table-id mapping, with the sequence
//! and file-number counters pinned in the header.
//!
//! ```text
//! [dbindex u32][version_size u32][srs_size u32][memtable_size u32]
//! [lookup_index_size u32][tableid_mapping_size u32]
//! [last_sequence u64][next_file_number u64]
//! [versions][subranges][memtable_partitions][lookup_index][tableid_mapping]
//! ```
//!
//! The destination worker restores the image into a fresh database bound to
//! the new epoch, schedules WAL tail replay for partitions that held an
//! active memtable, marks every restored memtable immutable, and only then
//! flips the fragment ready — no write lands before that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use blockhouse_cluster::ClusterConfig;
use blockhouse_core::{codec, Error, Result, SubRange};
use blockhouse_table::{BlockClient, MemManager};

use crate::db::{Db, MemTablePartition};
use crate::versions::VersionSet;

/// WAL file naming contract shared with the (external) log replication
/// layer.
pub fn log_file_name(server_id: u32, dbid: u32, memtable_id: u32) -> String {
    format!("wal-{server_id}-{dbid}-{memtable_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemTableLogFilePair {
    pub memtable_id: u32,
    pub log_file: String,
}

/// Replays WAL tails into restored memtables. The real implementation
/// lives with the log replication layer; tests plug in doubles.
pub trait LogReplayer: Send + Sync {
    fn recover(&self, pairs: &[MemTableLogFilePair]) -> Result<()>;
}

/// Replayer for deployments without WAL replication.
pub struct NoopLogReplayer;

impl LogReplayer for NoopLogReplayer {
    fn recover(&self, pairs: &[MemTableLogFilePair]) -> Result<()> {
        if !pairs.is_empty() {
            debug!(count = pairs.len(), "skipping log replay (noop replayer)");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbImage {
    pub dbindex: u32,
    pub last_sequence: u64,
    pub next_file_number: u64,
    pub versions: Bytes,
    pub subranges: Bytes,
    pub memtable_partitions: Bytes,
    pub lookup_index: Bytes,
    pub tableid_mapping: Bytes,
}

impl DbImage {
    /// Snapshot a database's coordinator-side state.
    pub fn capture(db: &Db) -> DbImage {
        let (versions, last_sequence, next_file_number, tableid_mapping) = {
            let versions = db.versions.lock().unwrap();
            (
                versions.encode_snapshot(),
                versions.last_sequence(),
                versions.next_file_number(),
                versions.encode_table_mapping(),
            )
        };

        let mut subranges = BytesMut::new();
        let srs = db.subranges();
        subranges.put_u32_le(srs.len() as u32);
        for sr in &srs {
            sr.encode(&mut subranges);
        }

        let mut partitions = BytesMut::new();
        let parts = db.partitions();
        partitions.put_u32_le(parts.len() as u32);
        for p in &parts {
            partitions.put_u32_le(p.partition_id);
            partitions.put_u8(p.active_memtable.is_some() as u8);
            partitions.put_u32_le(p.active_memtable.unwrap_or(0));
            partitions.put_u32_le(p.closed_log_files.len() as u32);
            for log in &p.closed_log_files {
                partitions.put_u32_le(*log);
            }
        }

        let mut lookup = BytesMut::new();
        let entries = db.lookup_index();
        lookup.put_u32_le(entries.len() as u32);
        for (key, memtable_id) in &entries {
            codec::put_bytes(&mut lookup, key);
            lookup.put_u32_le(*memtable_id);
        }

        DbImage {
            dbindex: db.dbid,
            last_sequence,
            next_file_number,
            versions,
            subranges: subranges.freeze(),
            memtable_partitions: partitions.freeze(),
            lookup_index: lookup.freeze(),
            tableid_mapping,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.dbindex);
        buf.put_u32_le(self.versions.len() as u32);
        buf.put_u32_le(self.subranges.len() as u32);
        buf.put_u32_le(self.memtable_partitions.len() as u32);
        buf.put_u32_le(self.lookup_index.len() as u32);
        buf.put_u32_le(self.tableid_mapping.len() as u32);
        buf.put_u64_le(self.last_sequence);
        buf.put_u64_le(self.next_file_number);
        buf.put_slice(&self.versions);
        buf.put_slice(&self.subranges);
        buf.put_slice(&self.memtable_partitions);
        buf.put_slice(&self.lookup_index);
        buf.put_slice(&self.tableid_mapping);
        buf.freeze()
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        let dbindex = codec::get_u32(src)?;
        let version_size = codec::get_u32(src)? as usize;
        let srs_size = codec::get_u32(src)? as usize;
        let memtable_size = codec::get_u32(src)? as usize;
        let lookup_index_size = codec::get_u32(src)? as usize;
        let tableid_mapping_size = codec::get_u32(src)? as usize;
        let last_sequence = codec::get_u64(src)?;
        let next_file_number = codec::get_u64(src)?;
        let total =
            version_size + srs_size + memtable_size + lookup_index_size + tableid_mapping_size;
        if src.len() < total {
            return Err(Error::corruption("migration image truncated"));
        }
        Ok(Self {
            dbindex,
            last_sequence,
            next_file_number,
            versions: src.split_to(version_size),
            subranges: src.split_to(srs_size),
            memtable_partitions: src.split_to(memtable_size),
            lookup_index: src.split_to(lookup_index_size),
            tableid_mapping: src.split_to(tableid_mapping_size),
        })
    }
}

pub struct DestinationMigration {
    config: Arc<ClusterConfig>,
    client: BlockClient,
    mem: Arc<MemManager>,
    replayer: Arc<dyn LogReplayer>,
    queue: Mutex<Vec<Bytes>>,
    signal: Semaphore,
    registry: Mutex<HashMap<u32, Arc<Db>>>,
}

impl DestinationMigration {
    pub fn new(
        config: Arc<ClusterConfig>,
        client: BlockClient,
        mem: Arc<MemManager>,
        replayer: Arc<dyn LogReplayer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            mem,
            replayer,
            queue: Mutex::new(Vec::new()),
            signal: Semaphore::new(0),
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Hand over a received migration buffer (with or without the opcode
    /// byte still in front).
    pub fn add_received_image(&self, buf: Bytes) {
        self.queue.lock().unwrap().push(buf);
        self.signal.add_permits(1);
    }

    pub fn db(&self, dbid: u32) -> Option<Arc<Db>> {
        self.registry.lock().unwrap().get(&dbid).cloned()
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            let permit = self.signal.acquire().await.expect("migration semaphore closed");
            permit.forget();
            let buffers: Vec<Bytes> = {
                let mut queue = self.queue.lock().unwrap();
                std::mem::take(&mut *queue)
            };
            for buf in buffers {
                if let Err(e) = self.recover_db_image(buf).await {
                    warn!(error = %e, "migration image rejected");
                }
            }
        }
    }

    /// Decode one image and bring the database up on this node.
    pub async fn recover_db_image(&self, buf: Bytes) -> Result<Arc<Db>> {
        let mut src = buf;
        if src.first() == Some(&(blockhouse_core::RequestType::LtcMigration as u8)) {
            src.advance(1);
        }
        let image = DbImage::decode(&mut src)?;
        let epoch_id = self.config.current_epoch_id();
        info!(db = image.dbindex, epoch = epoch_id, "restoring migrated database");

        let db = Db::new(
            image.dbindex,
            epoch_id,
            Arc::clone(&self.config),
            self.client.clone(),
            Arc::clone(&self.mem),
            false,
        );

        {
            let mut versions = db.versions.lock().unwrap();
            let mut blob = image.versions.clone();
            *versions =
                VersionSet::restore(&mut blob, image.last_sequence, image.next_file_number)?;
            let mut mapping = image.tableid_mapping.clone();
            versions.decode_table_mapping(&mut mapping)?;
        }

        let mut blob = image.subranges.clone();
        let count = codec::get_u32(&mut blob)? as usize;
        let mut subranges = Vec::with_capacity(count);
        for _ in 0..count {
            subranges.push(SubRange::decode(&mut blob)?);
        }
        db.set_subranges(subranges);

        let mut blob = image.memtable_partitions.clone();
        let count = codec::get_u32(&mut blob)? as usize;
        let mut partitions = Vec::with_capacity(count);
        for _ in 0..count {
            let partition_id = codec::get_u32(&mut blob)?;
            let has_active = codec::get_u8(&mut blob)? != 0;
            let active_id = codec::get_u32(&mut blob)?;
            let nclosed = codec::get_u32(&mut blob)? as usize;
            let mut closed_log_files = Vec::with_capacity(nclosed);
            for _ in 0..nclosed {
                closed_log_files.push(codec::get_u32(&mut blob)?);
            }
            partitions.push(MemTablePartition {
                partition_id,
                active_memtable: has_active.then_some(active_id),
                closed_log_files,
                immutable: false,
            });
        }
        db.set_partitions(partitions);

        let mut blob = image.lookup_index.clone();
        let count = codec::get_u32(&mut blob)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = codec::get_bytes(&mut blob)?;
            entries.push((key, codec::get_u32(&mut blob)?));
        }
        db.set_lookup_index(entries);

        // Replay WAL tails for partitions that held an active memtable.
        // Closed log files are carried in the image but not replayed here:
        // their contents were flushed before the logs closed.
        let prior_owner = self.prior_owner(image.dbindex, epoch_id);
        let pairs: Vec<MemTableLogFilePair> = db
            .partitions()
            .iter()
            .filter_map(|p| {
                p.active_memtable.map(|memtable_id| MemTableLogFilePair {
                    memtable_id,
                    log_file: log_file_name(prior_owner, image.dbindex, memtable_id),
                })
            })
            .collect();
        self.replayer.recover(&pairs)?;
        db.mark_partitions_immutable();

        db.mark_ready();
        self.registry
            .lock()
            .unwrap()
            .insert(image.dbindex, Arc::clone(&db));
        Ok(db)
    }

    /// The LTC that owned this database in the previous epoch; log files
    /// live under its id.
    fn prior_owner(&self, dbid: u32, epoch_id: u32) -> u32 {
        if epoch_id == 0 {
            return self.config.options.my_server_id;
        }
        match self.config.epoch(epoch_id - 1) {
            Ok(prior) => prior
                .fragments
                .iter()
                .find(|f| f.dbid == dbid)
                .map(|f| f.ltc_server_id)
                .unwrap_or(self.config.options.my_server_id),
            Err(_) => self.config.options.my_server_id,
        }
    }
}
