//! End-to-end scenarios over an in-process cluster: one or two LTCs and a
//! handful of StoCs wired through the loopback fabric.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use blockhouse_cluster::{fragment::parse_fragment_map, ClusterConfig, ClusterOptions};
use blockhouse_core::key::{InternalKey, ValueKind};
use blockhouse_ltc::db::db_name;
use blockhouse_ltc::{
    CompactionScheduler, Db, DbHandle, DbImage, DestinationMigration, NoopLogReplayer,
};
use blockhouse_ltc::db::CompactionTask;
use blockhouse_stoc::{LoopbackNetwork, StocServer};
use blockhouse_table::{BlockClient, MemManager};

const FRAGMENT_MAP: &str = "config\n0,1000000,0,0\nconfig\n0,1000000,4,0\n";

struct Cluster {
    _tmp: tempfile::TempDir,
    network: Arc<LoopbackNetwork>,
    num_stocs: u32,
    scatter_width: usize,
    block_size: usize,
    sstable_size: u64,
}

impl Cluster {
    async fn start(num_stocs: u32, scatter_width: usize, block_size: usize, sstable_size: u64) -> Self {
        let cluster = Self {
            _tmp: tempfile::tempdir().unwrap(),
            network: LoopbackNetwork::new(),
            num_stocs,
            scatter_width,
            block_size,
            sstable_size,
        };
        for server_id in 1..=num_stocs {
            let config = cluster.node_config(server_id);
            let mem = Arc::new(MemManager::new(4, 1 << 30));
            let client = BlockClient::new(server_id, cluster.network.transport(server_id));
            let server = StocServer::start(config, client, mem).unwrap();
            cluster.network.register(server);
        }
        cluster
    }

    fn node_config(&self, server_id: u32) -> Arc<ClusterConfig> {
        let stoc_servers: Vec<u32> = (1..=self.num_stocs).collect();
        let options: ClusterOptions = serde_json::from_value(serde_json::json!({
            "my_server_id": server_id,
            "ltc_servers": [0, 4],
            "stoc_servers": stoc_servers,
            "stoc_files_path": self._tmp.path().join(format!("stoc-{server_id}")),
            "db_path": self._tmp.path().join(format!("db-{server_id}")),
            "num_stocs_scatter_data_blocks": self.scatter_width,
            "scatter_policy": "random",
            "block_size": self.block_size,
            "sstable_size": self.sstable_size,
            "num_storage_workers": 4,
        }))
        .unwrap();
        ClusterConfig::new(options, parse_fragment_map(FRAGMENT_MAP).unwrap()).unwrap()
    }

    /// An LTC node: config, pinned memory, block client.
    fn ltc(&self, server_id: u32) -> (Arc<ClusterConfig>, Arc<MemManager>, BlockClient) {
        let config = self.node_config(server_id);
        let mem = Arc::new(MemManager::new(4, 1 << 30));
        let client = BlockClient::new(server_id, self.network.transport(server_id));
        (config, mem, client)
    }
}

fn put(user: &str, seq: u64, value: &str) -> (InternalKey, Bytes) {
    (
        InternalKey::new(Bytes::copy_from_slice(user.as_bytes()), seq, ValueKind::Value),
        Bytes::copy_from_slice(value.as_bytes()),
    )
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// ---------------------------------------------------------------
// Write then read across the cluster
// ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_then_read_across_three_stocs() {
    let cluster = Cluster::start(3, 3, 128, 16 << 20).await;
    let (config, mem, client) = cluster.ltc(0);
    let db = Db::new(0, 0, config, client, mem, true);

    let mut entries = vec![put("alice", 1, "\x01\x02")];
    for i in 0..60 {
        entries.push(put(&format!("k{i:04}"), 2 + i, &format!("value-{i}")));
    }
    let meta = db.flush_memtable(1, &entries, 7).await.unwrap();

    // The table really scattered: three groups on three distinct StoCs.
    assert_eq!(meta.data_block_group_handles.len(), 3);
    let mut servers: Vec<u32> = meta
        .data_block_group_handles
        .iter()
        .map(|h| h.server_id)
        .collect();
    servers.sort_unstable();
    servers.dedup();
    assert_eq!(servers.len(), 3);

    let value = db.get(b"alice").await.unwrap().expect("alice present");
    assert_eq!(value.as_ref(), b"\x01\x02");
    assert_eq!(
        db.get(b"k0033").await.unwrap().unwrap().as_ref(),
        b"value-33"
    );
    assert!(db.get(b"missing").await.unwrap().is_none());
}

// ---------------------------------------------------------------
// Scatter math: 7 data blocks over 3 groups
// ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scatter_math_seven_blocks_three_groups() {
    // Block size 1 cuts a data block per entry: 7 entries = 7 blocks.
    let cluster = Cluster::start(3, 3, 1, 16 << 20).await;
    let (config, mem, client) = cluster.ltc(0);
    let db = Db::new(0, 0, config, client, mem, true);

    let entries: Vec<_> = (1..=7)
        .map(|i| put(&format!("key{i}"), i as u64, "vvvv"))
        .collect();
    let meta = db.flush_memtable(1, &entries, 0).await.unwrap();

    // Groups carry 3, 2, 2 equal-sized blocks, in that order.
    let sizes: Vec<u64> = meta
        .data_block_group_handles
        .iter()
        .map(|h| h.size)
        .collect();
    assert_eq!(sizes.len(), 3);
    let block = sizes[1] / 2;
    assert_eq!(sizes, vec![3 * block, 2 * block, 2 * block]);

    // Index lookups land in the right group: the 1st, 4th, and 7th blocks
    // belong to groups 0, 1, and 2. Killing one group's StoC breaks
    // exactly the keys in that group.
    let g2 = meta.data_block_group_handles[2].server_id;
    cluster.network.fail_server(g2);
    assert!(db.get(b"key7").await.is_err(), "7th block lives in group 2");
    assert_eq!(db.get(b"key1").await.unwrap().unwrap().as_ref(), b"vvvv");
    assert_eq!(db.get(b"key4").await.unwrap().unwrap().as_ref(), b"vvvv");
    cluster.network.heal_server(g2);
    assert_eq!(db.get(b"key7").await.unwrap().unwrap().as_ref(), b"vvvv");
}

// ---------------------------------------------------------------
// Peer loss during read, failure window, reselection
// ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_loss_surfaces_and_recovers() {
    let cluster = Cluster::start(4, 3, 128, 16 << 20).await;
    let (config, mem, client) = cluster.ltc(0);
    let db = Db::new(0, 0, config, client.clone(), mem, true);

    let entries: Vec<_> = (0..60)
        .map(|i| put(&format!("k{i:04}"), 1 + i, &format!("v{i}")))
        .collect();
    let meta = db.flush_memtable(1, &entries, 0).await.unwrap();

    let victim = meta.data_block_group_handles[1].server_id;
    cluster.network.fail_server(victim);
    let err = db.get(b"k0030").await.unwrap_err();
    assert!(matches!(err, blockhouse_core::Error::Transport { .. }));

    // Declare the peer failed; new scatters avoid it entirely.
    client.mark_failed(victim, Duration::from_millis(80));
    let entries2: Vec<_> = (0..60)
        .map(|i| put(&format!("m{i:04}"), 100 + i, "x"))
        .collect();
    let meta2 = db.flush_memtable(2, &entries2, 0).await.unwrap();
    assert!(meta2
        .data_block_group_handles
        .iter()
        .all(|h| h.server_id != victim));

    // Once the failure window elapses and the peer heals, the old group
    // is readable again.
    tokio::time::sleep(Duration::from_millis(120)).await;
    cluster.network.heal_server(victim);
    assert!(!client.is_failed(victim));
    assert_eq!(db.get(b"k0030").await.unwrap().unwrap().as_ref(), b"v30");
}

// ---------------------------------------------------------------
// Remote compaction: ordered, non-overlapping L1
// ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compaction_produces_ordered_l1() {
    let cluster = Cluster::start(3, 3, 128, 1024).await;
    let (config, mem, client) = cluster.ltc(0);
    let db = Db::new(0, 0, Arc::clone(&config), client, mem, true);

    // Two overlapping L0 runs; the second shadows k20..k30.
    let older: Vec<_> = (0..31)
        .map(|i| put(&format!("k{i:02}"), 100 + i, &format!("old-{i}")))
        .collect();
    let newer: Vec<_> = (20..51)
        .map(|i| put(&format!("k{i:02}"), 200 + i, &format!("new-{i}")))
        .collect();
    db.flush_memtable(1, &older, 0).await.unwrap();
    db.flush_memtable(2, &newer, 1).await.unwrap();
    assert_eq!(db.versions.lock().unwrap().num_files(0), 2);

    let scheduler = CompactionScheduler::new(Arc::clone(&config));
    scheduler.register_db(DbHandle::new(&db));
    let runner = tokio::spawn(Arc::clone(&scheduler).run());
    scheduler.schedule(CompactionTask {
        dbid: 0,
        source_level: 0,
    });

    wait_until(|| {
        let versions = db.versions.lock().unwrap();
        versions.num_files(0) == 0 && versions.num_files(1) > 0
    })
    .await;

    {
        let versions = db.versions.lock().unwrap();
        let l1 = versions.files(1);
        // Small sstable target forces several outputs.
        assert!(l1.len() > 1, "expected multiple L1 files, got {}", l1.len());
        // Key-ascending, pairwise non-overlapping partition of the union.
        for pair in l1.windows(2) {
            assert!(pair[0].largest.user_key() < pair[1].smallest.user_key());
        }
        // Compaction outputs embed the executing StoC's node id.
        for f in l1 {
            assert!(f.number >> 32 >= 1, "file number {} lacks node id", f.number);
        }
    }

    // The union key set survived, newest versions winning.
    assert_eq!(db.get(b"k05").await.unwrap().unwrap().as_ref(), b"old-5");
    assert_eq!(db.get(b"k25").await.unwrap().unwrap().as_ref(), b"new-25");
    assert_eq!(db.get(b"k50").await.unwrap().unwrap().as_ref(), b"new-50");

    scheduler.stop();
    let _ = runner.await;
}

// ---------------------------------------------------------------
// Migration / handoff
// ---------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_migration_preserves_reads_and_number_space() {
    let cluster = Cluster::start(3, 3, 128, 16 << 20).await;

    // Owner A (server 0) builds three L0 tables, last sequence 100.
    let (config_a, mem_a, client_a) = cluster.ltc(0);
    let db_a = Db::new(0, 0, config_a, client_a, mem_a, true);
    let runs = [
        (0u64, 33u64),
        (33, 66),
        (66, 100),
    ];
    for (mid, &(lo, hi)) in runs.iter().enumerate() {
        let entries: Vec<_> = (lo..hi)
            .map(|i| put(&format!("key{i:03}"), i + 1, &format!("val{i}")))
            .collect();
        db_a.flush_memtable(mid as u32 + 1, &entries, 0).await.unwrap();
    }
    assert_eq!(db_a.last_sequence(), 100);
    db_a.set_partitions(vec![blockhouse_ltc::db::MemTablePartition {
        partition_id: 0,
        active_memtable: Some(9),
        closed_log_files: vec![3, 4],
        immutable: false,
    }]);
    db_a.set_lookup_index(vec![(Bytes::from_static(b"key099"), 9)]);

    let image = DbImage::capture(&db_a).encode();

    // Destination B (server 4) comes up in the next epoch.
    let (config_b, mem_b, client_b) = cluster.ltc(4);
    config_b.advance_epoch().unwrap();
    let migration = DestinationMigration::new(
        Arc::clone(&config_b),
        client_b,
        mem_b,
        Arc::new(NoopLogReplayer),
    );
    let db_b = migration.recover_db_image(image).await.unwrap();

    assert!(db_b.is_ready());
    assert_eq!(db_b.epoch_id, 1);
    assert_eq!(db_b.last_sequence(), 100);
    assert_eq!(db_b.dbname, db_name(0));

    // Every key A could answer at sequence 100, B answers identically.
    for i in [0u64, 42, 67, 99] {
        let value = db_b
            .get(format!("key{i:03}").as_bytes())
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("key{i:03} lost in migration"));
        assert_eq!(value.as_ref(), format!("val{i}").as_bytes());
    }

    // Restored bookkeeping: partitions immutable, lookup index intact.
    let parts = db_b.partitions();
    assert_eq!(parts.len(), 1);
    assert!(parts[0].immutable);
    assert_eq!(parts[0].closed_log_files, vec![3, 4]);
    assert_eq!(db_b.lookup_memtable(b"key099"), Some(9));

    // A subsequent write on B advances the sequence without colliding on
    // file numbers.
    let pre_flush_next = db_b.versions.lock().unwrap().next_file_number();
    let a_numbers: Vec<u64> = db_a
        .versions
        .lock()
        .unwrap()
        .files(0)
        .iter()
        .map(|f| f.number)
        .collect();
    let meta = db_b
        .flush_memtable(10, &[put("key100", 101, "fresh")], 2)
        .await
        .unwrap();
    assert_eq!(db_b.last_sequence(), 101);
    assert!(meta.number >= pre_flush_next);
    assert!(!a_numbers.contains(&meta.number));
    assert_eq!(db_b.get(b"key100").await.unwrap().unwrap().as_ref(), b"fresh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_writes_before_fragment_ready() {
    let cluster = Cluster::start(3, 3, 128, 16 << 20).await;
    let (config, mem, client) = cluster.ltc(0);
    let db = Db::new(0, 0, config, client, mem, false);

    let err = db
        .flush_memtable(1, &[put("k", 1, "v")], 0)
        .await
        .unwrap_err();
    assert!(matches!(err, blockhouse_core::Error::InvalidRequest(_)));

    // Readiness broadcast wakes waiters, then writes flow.
    let waiter = {
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            db.wait_ready().await;
        })
    };
    db.mark_ready();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("ready broadcast reached waiter")
        .unwrap();
    assert!(db.flush_memtable(1, &[put("k", 1, "v")], 0).await.is_ok());
}
