//! Cluster Configuration
//!
//! `ClusterOptions` is the serde-friendly knob struct a deployment loads
//! once. `ClusterConfig` is the runtime view: immutable except for the
//! current-epoch pointer, shared as an `Arc` so every thread reads a
//! consistent snapshot and nobody mutates global state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use blockhouse_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::fragment::Epoch;

/// Strategy for choosing StoCs when scattering an SSTable's block groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterPolicy {
    /// Uniform random distinct peers.
    Random,
    /// Two random candidates per slot, keep the less loaded.
    PowerOfTwo,
    /// Three random candidates per slot, keep the least loaded.
    PowerOfThree,
    /// Deterministic spread over the least-loaded peers.
    ScatterStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOptions {
    pub my_server_id: u32,
    pub ltc_servers: Vec<u32>,
    pub stoc_servers: Vec<u32>,

    /// Root for StoC segment files.
    pub stoc_files_path: PathBuf,
    /// Root for per-database metadata SSTables.
    pub db_path: PathBuf,

    /// Segments stop accepting data appends past this size.
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,
    /// Target SSTable size; also the pinned build-buffer allocation.
    #[serde(default = "default_sstable_size")]
    pub sstable_size: u64,
    /// Target size of one data block inside an SSTable.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// How many StoCs one SSTable's data blocks scatter across.
    #[serde(default = "default_scatter_width")]
    pub num_stocs_scatter_data_blocks: usize,
    #[serde(default = "default_scatter_policy")]
    pub scatter_policy: ScatterPolicy,
    /// Log replicas per fragment.
    #[serde(default = "default_log_replicas")]
    pub num_log_replicas: usize,

    #[serde(default = "default_storage_workers")]
    pub num_storage_workers: usize,
    #[serde(default = "default_compaction_workers")]
    pub num_compaction_workers: usize,
    #[serde(default = "default_rdma_server_threads")]
    pub num_rdma_server_threads: usize,

    /// Failure injection: declare this StoC failed...
    #[serde(default)]
    pub fail_stoc_id: Option<u32>,
    /// ...this many seconds into the experiment...
    #[serde(default)]
    pub exp_seconds_to_fail_stoc: u64,
    /// ...for this many seconds.
    #[serde(default)]
    pub failure_duration: u64,
}

fn default_max_segment_size() -> u64 {
    128 * 1024 * 1024
}

fn default_sstable_size() -> u64 {
    16 * 1024 * 1024
}

fn default_block_size() -> usize {
    4 * 1024
}

fn default_scatter_width() -> usize {
    3
}

fn default_scatter_policy() -> ScatterPolicy {
    ScatterPolicy::Random
}

fn default_log_replicas() -> usize {
    1
}

fn default_storage_workers() -> usize {
    4
}

fn default_compaction_workers() -> usize {
    2
}

fn default_rdma_server_threads() -> usize {
    2
}

/// Runtime cluster view. Everything is immutable except the current-epoch
/// pointer; epoch payloads are shared as `Arc<Epoch>` snapshots.
#[derive(Debug)]
pub struct ClusterConfig {
    pub options: ClusterOptions,
    epochs: Vec<Arc<Epoch>>,
    current_epoch: AtomicU32,
}

impl ClusterConfig {
    pub fn new(options: ClusterOptions, epochs: Vec<Epoch>) -> Result<Arc<Self>> {
        if epochs.is_empty() {
            return Err(Error::InvalidRequest("at least one epoch required".to_string()));
        }
        Ok(Arc::new(Self {
            options,
            epochs: epochs.into_iter().map(Arc::new).collect(),
            current_epoch: AtomicU32::new(0),
        }))
    }

    pub fn current_epoch_id(&self) -> u32 {
        self.current_epoch.load(Ordering::Acquire)
    }

    pub fn current_epoch(&self) -> Arc<Epoch> {
        Arc::clone(&self.epochs[self.current_epoch_id() as usize])
    }

    pub fn epoch(&self, epoch_id: u32) -> Result<Arc<Epoch>> {
        self.epochs
            .get(epoch_id as usize)
            .cloned()
            .ok_or(Error::EpochMismatch {
                requested: epoch_id,
                current: self.current_epoch_id(),
            })
    }

    /// Advance to the next configured epoch; returns the new id. Epochs only
    /// move forward.
    pub fn advance_epoch(&self) -> Result<u32> {
        let current = self.current_epoch.load(Ordering::Acquire);
        let next = current + 1;
        if next as usize >= self.epochs.len() {
            return Err(Error::EpochMismatch {
                requested: next,
                current,
            });
        }
        self.current_epoch.store(next, Ordering::Release);
        tracing::info!(epoch = next, "cluster configuration advanced");
        Ok(next)
    }

    pub fn is_stoc(&self, server_id: u32) -> bool {
        self.options.stoc_servers.contains(&server_id)
    }

    /// Remote StoCs eligible for scatter targets.
    pub fn remote_stocs(&self) -> Vec<u32> {
        self.options
            .stoc_servers
            .iter()
            .copied()
            .filter(|&s| s != self.options.my_server_id)
            .collect()
    }
}
