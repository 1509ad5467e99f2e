//! Compaction Scheduler
//!
//! One scheduler task per LTC. Triggers land in a FIFO behind a mutex; a
//! counting semaphore tracks how many are queued. The loop drains the whole
//! queue each round and groups tasks by database, so a burst of small
//! triggers coalesces into a single compaction pass per database — and a
//! database only ever sees compaction calls from one thread at a time.
//!
//! `num_running_tasks` is a monotone counter; the stats aggregator reads
//! deltas off it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use blockhouse_cluster::ClusterConfig;

use crate::db::{CompactionTask, DbHandle};

const MAX_QUEUED_TASKS: usize = 1024;

pub struct CompactionScheduler {
    config: Arc<ClusterConfig>,
    queue: Mutex<Vec<CompactionTask>>,
    signal: Semaphore,
    num_tasks: AtomicU32,
    running: AtomicBool,
    dbs: Mutex<HashMap<u32, DbHandle>>,
}

impl CompactionScheduler {
    pub fn new(config: Arc<ClusterConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue: Mutex::new(Vec::new()),
            signal: Semaphore::new(0),
            num_tasks: AtomicU32::new(0),
            running: AtomicBool::new(true),
            dbs: Mutex::new(HashMap::new()),
        })
    }

    /// Register the capability handle a database is reachable through.
    pub fn register_db(&self, handle: DbHandle) {
        self.dbs.lock().unwrap().insert(handle.dbid, handle);
    }

    /// Enqueue a trigger. Returns false when the queue is saturated; the
    /// caller simply retries on its next trigger.
    pub fn schedule(&self, task: CompactionTask) -> bool {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= MAX_QUEUED_TASKS {
                warn!(db = task.dbid, "compaction queue full, trigger dropped");
                return false;
            }
            queue.push(task);
        }
        self.signal.add_permits(1);
        true
    }

    /// Monotone count of tasks ever dispatched.
    pub fn num_running_tasks(&self) -> u32 {
        self.num_tasks.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.signal.add_permits(1);
    }

    pub async fn run(self: Arc<Self>) {
        debug!("compaction scheduler started");
        while self.running.load(Ordering::Acquire) {
            let permit = self.signal.acquire().await.expect("scheduler semaphore closed");
            permit.forget();

            let tasks: Vec<CompactionTask> = {
                let mut queue = self.queue.lock().unwrap();
                std::mem::take(&mut *queue)
            };
            if tasks.is_empty() {
                continue;
            }
            self.num_tasks.fetch_add(tasks.len() as u32, Ordering::Relaxed);

            let mut by_db: HashMap<u32, Vec<CompactionTask>> = HashMap::new();
            for task in tasks {
                by_db.entry(task.dbid).or_default().push(task);
            }

            let current_epoch = self.config.current_epoch_id();
            for (dbid, group) in by_db {
                let handle = self.dbs.lock().unwrap().get(&dbid).cloned();
                let Some(handle) = handle else {
                    warn!(dbid, "compaction trigger for unregistered db");
                    continue;
                };
                // Validate the capability at dispatch, not at enqueue: the
                // epoch may have advanced in between.
                let Some(db) = handle.acquire(current_epoch) else {
                    warn!(dbid, current_epoch, "stale db capability, tasks dropped");
                    continue;
                };
                if let Err(e) = db.perform_compaction(&group).await {
                    warn!(dbid, error = %e, "compaction pass failed");
                }
            }
        }
        debug!("compaction scheduler stopped");
    }
}
