//! Stats Aggregator
//!
//! Every ten seconds, read the monotone counters of every worker pool and
//! log the delta since the previous round. Counters never reset and the
//! aggregator only loads atomics, so a slow log consumer cannot stall a
//! worker. One line per round:
//!
//! ```text
//! frdma:3,1,
//! brdma:0,2,
//! compaction:4,
//! storage:12,9,
//! storage-read:40960,0,
//! storage-write:8192,4096,
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use blockhouse_table::BlockClient;

use crate::scheduler::CompactionScheduler;

/// A monotone task counter (foreground/background RDMA workers, the
/// compaction scheduler).
pub trait TaskCounterSource: Send + Sync {
    fn tasks(&self) -> u32;
}

impl TaskCounterSource for BlockClient {
    fn tasks(&self) -> u32 {
        self.stat_tasks()
    }
}

impl TaskCounterSource for CompactionScheduler {
    fn tasks(&self) -> u32 {
        self.num_running_tasks()
    }
}

/// Storage worker counters: tasks plus byte totals.
pub trait StorageStatSource: Send + Sync {
    fn tasks(&self) -> u32;
    fn read_bytes(&self) -> u64;
    fn write_bytes(&self) -> u64;
}

#[derive(Default)]
struct Snapshot {
    fg_tasks: Vec<u32>,
    bg_tasks: Vec<u32>,
    compaction_tasks: Vec<u32>,
    storage_tasks: Vec<u32>,
    storage_read: Vec<u64>,
    storage_write: Vec<u64>,
}

pub struct StatsAggregator {
    fg_rdma: Vec<Arc<dyn TaskCounterSource>>,
    bg_rdma: Vec<Arc<dyn TaskCounterSource>>,
    compaction: Vec<Arc<dyn TaskCounterSource>>,
    storage: Vec<Arc<dyn StorageStatSource>>,
    interval: Duration,
    prev: Snapshot,
}

impl StatsAggregator {
    pub fn new(
        fg_rdma: Vec<Arc<dyn TaskCounterSource>>,
        bg_rdma: Vec<Arc<dyn TaskCounterSource>>,
        compaction: Vec<Arc<dyn TaskCounterSource>>,
        storage: Vec<Arc<dyn StorageStatSource>>,
    ) -> Self {
        let prev = Snapshot {
            fg_tasks: fg_rdma.iter().map(|s| s.tasks()).collect(),
            bg_tasks: bg_rdma.iter().map(|s| s.tasks()).collect(),
            compaction_tasks: compaction.iter().map(|s| s.tasks()).collect(),
            storage_tasks: storage.iter().map(|s| s.tasks()).collect(),
            storage_read: storage.iter().map(|s| s.read_bytes()).collect(),
            storage_write: storage.iter().map(|s| s.write_bytes()).collect(),
        };
        Self {
            fg_rdma,
            bg_rdma,
            compaction,
            storage,
            interval: Duration::from_secs(10),
            prev,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One round: read every counter, emit deltas, remember the values.
    pub fn format_deltas(&mut self) -> String {
        fn delta_line_u32(
            label: &str,
            prev: &mut [u32],
            now: impl Iterator<Item = u32>,
        ) -> String {
            let mut line = format!("{label}:");
            for (slot, value) in prev.iter_mut().zip(now) {
                line.push_str(&value.wrapping_sub(*slot).to_string());
                line.push(',');
                *slot = value;
            }
            line.push('\n');
            line
        }
        fn delta_line_u64(
            label: &str,
            prev: &mut [u64],
            now: impl Iterator<Item = u64>,
        ) -> String {
            let mut line = format!("{label}:");
            for (slot, value) in prev.iter_mut().zip(now) {
                line.push_str(&value.wrapping_sub(*slot).to_string());
                line.push(',');
                *slot = value;
            }
            line.push('\n');
            line
        }

        let mut output = String::new();
        output.push_str(&delta_line_u32(
            "frdma",
            &mut self.prev.fg_tasks,
            self.fg_rdma.iter().map(|s| s.tasks()),
        ));
        output.push_str(&delta_line_u32(
            "brdma",
            &mut self.prev.bg_tasks,
            self.bg_rdma.iter().map(|s| s.tasks()),
        ));
        output.push_str(&delta_line_u32(
            "compaction",
            &mut self.prev.compaction_tasks,
            self.compaction.iter().map(|s| s.tasks()),
        ));
        output.push_str(&delta_line_u32(
            "storage",
            &mut self.prev.storage_tasks,
            self.storage.iter().map(|s| s.tasks()),
        ));
        output.push_str(&delta_line_u64(
            "storage-read",
            &mut self.prev.storage_read,
            self.storage.iter().map(|s| s.read_bytes()),
        ));
        output.push_str(&delta_line_u64(
            "storage-write",
            &mut self.prev.storage_write,
            self.storage.iter().map(|s| s.write_bytes()),
        ));
        output
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let output = self.format_deltas();
            info!("stats:\n{output}");
        }
    }
}
