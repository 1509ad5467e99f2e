//! Storage Worker Pool
//!
//! Each worker owns a task queue and a counting semaphore. The loop is:
//! wait on the semaphore, drain the whole queue under the lock, execute each
//! task, then batch completions by the server thread that owns the
//! originating connection so response sends stay serialized per connection.
//!
//! Workers never retry: a duplicate `stoc_req_id` is executed again and
//! produces a duplicate completion, which the LTC's request-id table drops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

use blockhouse_core::{CompactionRequest, Result, StoCBlockHandle, VersionEdit};
use blockhouse_table::filename::sstable_name;

use crate::compaction::CompactionExecutor;
use crate::segment::StocFileManager;

#[derive(Debug, Clone)]
pub struct PersistPair {
    pub stoc_file_id: u32,
    pub sstable_name: String,
}

#[derive(Debug)]
pub enum StorageTask {
    ReadBlocks {
        stoc_file_id: u32,
        ranges: Vec<(u64, u64)>,
    },
    ReadSstable {
        stoc_file_id: u32,
        sstable_name: String,
    },
    Persist {
        pairs: Vec<PersistPair>,
        is_meta: bool,
        /// Also set for whole-table flushes.
        seal: bool,
    },
    Compaction {
        request: Box<CompactionRequest>,
    },
    DeleteTables {
        dbname: String,
        file_numbers: Vec<u64>,
    },
}

#[derive(Debug)]
pub struct QueuedTask {
    pub remote_server_id: u32,
    pub stoc_req_id: u32,
    /// Which server thread's completion queue gets the response.
    pub rdma_server_thread_id: usize,
    pub task: StorageTask,
}

#[derive(Debug)]
pub enum TaskOutput {
    Data(Bytes),
    Handles { handles: Vec<StoCBlockHandle>, sealed: bool },
    Edit(VersionEdit),
    None,
}

#[derive(Debug)]
pub struct CompleteTask {
    pub remote_server_id: u32,
    pub stoc_req_id: u32,
    pub result: Result<TaskOutput>,
}

/// Monotone counters read by the stats aggregator.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub stat_tasks: AtomicU32,
    pub stat_read_bytes: AtomicU64,
    pub stat_write_bytes: AtomicU64,
}

pub struct StorageWorker {
    worker_id: usize,
    manager: Arc<StocFileManager>,
    compactor: Arc<CompactionExecutor>,
    queue: Mutex<VecDeque<QueuedTask>>,
    signal: Semaphore,
    running: AtomicBool,
    pub stats: Arc<WorkerStats>,
    /// One completion channel per server thread.
    completions: Vec<mpsc::UnboundedSender<Vec<CompleteTask>>>,
}

impl StorageWorker {
    pub fn new(
        worker_id: usize,
        manager: Arc<StocFileManager>,
        compactor: Arc<CompactionExecutor>,
        completions: Vec<mpsc::UnboundedSender<Vec<CompleteTask>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            manager,
            compactor,
            queue: Mutex::new(VecDeque::new()),
            signal: Semaphore::new(0),
            running: AtomicBool::new(true),
            stats: Arc::new(WorkerStats::default()),
            completions,
        })
    }

    pub fn add_task(&self, task: QueuedTask) {
        self.queue.lock().unwrap().push_back(task);
        self.signal.add_permits(1);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.signal.add_permits(1);
    }

    pub async fn run(self: Arc<Self>) {
        debug!(worker = self.worker_id, "storage worker started");
        while self.running.load(Ordering::Acquire) {
            let permit = self.signal.acquire().await.expect("worker semaphore closed");
            permit.forget();

            let tasks: Vec<QueuedTask> = {
                let mut queue = self.queue.lock().unwrap();
                queue.drain(..).collect()
            };
            if tasks.is_empty() {
                continue;
            }

            let mut per_thread: HashMap<usize, Vec<CompleteTask>> = HashMap::new();
            for queued in tasks {
                self.stats.stat_tasks.fetch_add(1, Ordering::Relaxed);
                let result = self.execute(queued.task).await;
                debug!(
                    worker = self.worker_id,
                    req = queued.stoc_req_id,
                    from = queued.remote_server_id,
                    ok = result.is_ok(),
                    "task executed"
                );
                per_thread
                    .entry(queued.rdma_server_thread_id)
                    .or_default()
                    .push(CompleteTask {
                        remote_server_id: queued.remote_server_id,
                        stoc_req_id: queued.stoc_req_id,
                        result,
                    });
            }
            for (thread_id, batch) in per_thread {
                if self.completions[thread_id].send(batch).is_err() {
                    error!(thread_id, "completion channel closed");
                }
            }
        }
    }

    async fn execute(&self, task: StorageTask) -> Result<TaskOutput> {
        match task {
            StorageTask::ReadBlocks {
                stoc_file_id,
                ranges,
            } => {
                let mut out = BytesMut::new();
                for (offset, size) in ranges {
                    out.extend_from_slice(&self.manager.read(stoc_file_id, offset, size)?);
                }
                self.stats
                    .stat_read_bytes
                    .fetch_add(out.len() as u64, Ordering::Relaxed);
                Ok(TaskOutput::Data(out.freeze()))
            }
            StorageTask::ReadSstable {
                stoc_file_id,
                sstable_name,
            } => {
                let handle = self.manager.stoc_block_handle(stoc_file_id, &sstable_name)?;
                let data = self.manager.read(stoc_file_id, handle.offset, handle.size)?;
                self.stats
                    .stat_read_bytes
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(TaskOutput::Data(data))
            }
            StorageTask::Persist {
                pairs,
                is_meta,
                seal,
            } => {
                let mut handles = Vec::with_capacity(pairs.len());
                let sealed = is_meta || seal;
                for pair in pairs {
                    let written = self.manager.persist(pair.stoc_file_id)?;
                    self.stats
                        .stat_write_bytes
                        .fetch_add(written, Ordering::Relaxed);
                    handles.push(
                        self.manager
                            .stoc_block_handle(pair.stoc_file_id, &pair.sstable_name)?,
                    );
                    if sealed {
                        self.manager.force_seal(pair.stoc_file_id)?;
                    }
                }
                Ok(TaskOutput::Handles { handles, sealed })
            }
            StorageTask::Compaction { request } => {
                let edit = self.compactor.execute(&request).await?;
                Ok(TaskOutput::Edit(edit))
            }
            StorageTask::DeleteTables {
                dbname,
                file_numbers,
            } => {
                for fnumber in file_numbers {
                    self.manager.delete_sstable(&sstable_name(&dbname, fnumber));
                }
                Ok(TaskOutput::None)
            }
        }
    }
}
