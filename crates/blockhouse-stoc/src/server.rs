//! StoC Request Dispatcher
//!
//! Decodes wire frames into storage tasks, spreads them round-robin over
//! the worker pool, and routes each completion back through the server
//! thread that owns the originating connection — one pump task per thread,
//! so responses on a connection are serialized even though workers finish
//! out of order. Request ids keyed per thread match completions to waiters;
//! a completion with no waiter (a duplicate execution) is dropped.
//!
//! `LoopbackNetwork` is the in-process transport: single-process
//! deployments and tests wire every role through it instead of the RDMA
//! fabric.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use blockhouse_cluster::ClusterConfig;
use blockhouse_core::wire::{
    self, AllocateLogBufferRequest, AllocateLogBufferResponse, AppendBlockRequest,
    AppendBlockResponse, CompactionRequestFrame, CompactionResponse, DeleteTablesRequest,
    FlushSstableRequest, FlushSstableResponse, PersistRequest, PersistResponse,
    ReadBlocksRequest, ReadSstableRequest, RequestType,
};
use blockhouse_core::{Error, Result};
use blockhouse_table::filename::sstable_name;
use blockhouse_table::{BlockClient, MemManager, PinnedBuf, Transport};

use crate::compaction::CompactionExecutor;
use crate::segment::StocFileManager;
use crate::worker::{
    CompleteTask, PersistPair, QueuedTask, StorageTask, StorageWorker, TaskOutput, WorkerStats,
};

pub struct StocServer {
    server_id: u32,
    manager: Arc<StocFileManager>,
    workers: Vec<Arc<StorageWorker>>,
    next_worker: AtomicUsize,
    next_req_id: AtomicU32,
    num_server_threads: usize,
    pending: Mutex<HashMap<u64, oneshot::Sender<CompleteTask>>>,
    mem: Arc<MemManager>,
    log_buffers: Mutex<Vec<PinnedBuf>>,
}

fn pending_key(thread_id: usize, req_id: u32) -> u64 {
    ((thread_id as u64) << 32) | req_id as u64
}

impl StocServer {
    /// Build the segment manager, worker pool, and completion pumps for one
    /// StoC node.
    pub fn start(
        config: Arc<ClusterConfig>,
        client: BlockClient,
        mem: Arc<MemManager>,
    ) -> Result<Arc<Self>> {
        let server_id = config.options.my_server_id;
        let manager = StocFileManager::new(
            server_id,
            config.options.stoc_files_path.clone(),
            config.options.max_segment_size,
        )?;
        let num_server_threads = config.options.num_rdma_server_threads.max(1);
        let mut senders = Vec::with_capacity(num_server_threads);
        let mut receivers = Vec::with_capacity(num_server_threads);
        for _ in 0..num_server_threads {
            let (tx, rx) = mpsc::unbounded_channel::<Vec<CompleteTask>>();
            senders.push(tx);
            receivers.push(rx);
        }

        let compactor = CompactionExecutor::new(
            Arc::clone(&config),
            client,
            Arc::clone(&mem),
            Arc::clone(&manager),
        );
        // A compaction occupies its worker while its scatter appends queue
        // on the others, so the pool is never smaller than two.
        let nworkers = config.options.num_storage_workers.max(2);
        let workers: Vec<Arc<StorageWorker>> = (0..nworkers)
            .map(|i| {
                StorageWorker::new(
                    i,
                    Arc::clone(&manager),
                    Arc::clone(&compactor),
                    senders.clone(),
                )
            })
            .collect();
        for worker in &workers {
            tokio::spawn(Arc::clone(worker).run());
        }

        let server = Arc::new(Self {
            server_id,
            manager,
            workers,
            next_worker: AtomicUsize::new(0),
            next_req_id: AtomicU32::new(1),
            num_server_threads,
            pending: Mutex::new(HashMap::new()),
            mem,
            log_buffers: Mutex::new(Vec::new()),
        });
        for (thread_id, rx) in receivers.into_iter().enumerate() {
            tokio::spawn(Arc::clone(&server).completion_pump(thread_id, rx));
        }
        Ok(server)
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn manager(&self) -> &Arc<StocFileManager> {
        &self.manager
    }

    pub fn worker_stats(&self) -> Vec<Arc<WorkerStats>> {
        self.workers.iter().map(|w| Arc::clone(&w.stats)).collect()
    }

    async fn completion_pump(
        self: Arc<Self>,
        thread_id: usize,
        mut rx: mpsc::UnboundedReceiver<Vec<CompleteTask>>,
    ) {
        while let Some(batch) = rx.recv().await {
            for completion in batch {
                let key = pending_key(thread_id, completion.stoc_req_id);
                let waiter = self.pending.lock().unwrap().remove(&key);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(completion);
                    }
                    None => debug!(
                        thread_id,
                        req = completion.stoc_req_id,
                        "dropping completion without waiter"
                    ),
                }
            }
        }
    }

    fn submit(&self, from_server: u32, task: StorageTask) -> oneshot::Receiver<CompleteTask> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let thread_id = (req_id as usize) % self.num_server_threads;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(pending_key(thread_id, req_id), tx);
        self.dispatch(from_server, req_id, thread_id, task);
        rx
    }

    /// Fire-and-forget: the eventual completion finds no waiter and is
    /// dropped by the pump.
    fn submit_no_reply(&self, from_server: u32, task: StorageTask) {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let thread_id = (req_id as usize) % self.num_server_threads;
        self.dispatch(from_server, req_id, thread_id, task);
    }

    fn dispatch(&self, from_server: u32, req_id: u32, thread_id: usize, task: StorageTask) {
        // Compactions pin to worker 0. Their scatter appends come back to
        // this pool as persist tasks; keeping those off the compaction
        // worker means a job can never wait on a task queued behind itself.
        let w = match &task {
            StorageTask::Compaction { .. } => 0,
            _ => 1 + self.next_worker.fetch_add(1, Ordering::Relaxed) % (self.workers.len() - 1),
        };
        self.workers[w].add_task(QueuedTask {
            remote_server_id: from_server,
            stoc_req_id: req_id,
            rdma_server_thread_id: thread_id,
            task,
        });
    }

    async fn await_output(&self, rx: oneshot::Receiver<CompleteTask>) -> Result<TaskOutput> {
        let completion = rx
            .await
            .map_err(|_| Error::transport(self.server_id, "storage worker dropped task"))?;
        completion.result
    }

    /// Serve one decoded frame from `from_server`. The loopback transport
    /// and the RDMA server threads both land here.
    pub async fn handle_frame(&self, from_server: u32, mut frame: Bytes) -> Result<Bytes> {
        match wire::peek_opcode(&frame)? {
            RequestType::AppendBlock => {
                let req = AppendBlockRequest::decode(&mut frame)?;
                let name = sstable_name(&req.dbname, req.file_number);
                let (stoc_file_id, _) =
                    self.manager.append(&name, &req.payload, req.is_meta)?;
                let rx = self.submit(
                    from_server,
                    StorageTask::Persist {
                        pairs: vec![PersistPair {
                            stoc_file_id,
                            sstable_name: name,
                        }],
                        is_meta: req.is_meta,
                        seal: false,
                    },
                );
                match self.await_output(rx).await? {
                    TaskOutput::Handles { handles, .. } => Ok(AppendBlockResponse {
                        handle: handles[0],
                    }
                    .encode()),
                    other => Err(unexpected_output(&other)),
                }
            }
            RequestType::FlushSstable => {
                let req = FlushSstableRequest::decode(&mut frame)?;
                let name = sstable_name(&req.dbname, req.file_number);
                let (stoc_file_id, _) = self.manager.append(&name, &req.payload, true)?;
                let rx = self.submit(
                    from_server,
                    StorageTask::Persist {
                        pairs: vec![PersistPair {
                            stoc_file_id,
                            sstable_name: name,
                        }],
                        is_meta: false,
                        // A whole table file seals its segment.
                        seal: true,
                    },
                );
                match self.await_output(rx).await? {
                    TaskOutput::Handles { handles, .. } => Ok(FlushSstableResponse {
                        handle: handles[0],
                    }
                    .encode()),
                    other => Err(unexpected_output(&other)),
                }
            }
            RequestType::ReadBlocks => {
                let req = ReadBlocksRequest::decode(&mut frame)?;
                let rx = self.submit(
                    from_server,
                    StorageTask::ReadBlocks {
                        stoc_file_id: req.stoc_file_id,
                        ranges: req.ranges,
                    },
                );
                match self.await_output(rx).await? {
                    TaskOutput::Data(data) => Ok(data),
                    other => Err(unexpected_output(&other)),
                }
            }
            RequestType::ReadSstable => {
                let req = ReadSstableRequest::decode(&mut frame)?;
                let rx = self.submit(
                    from_server,
                    StorageTask::ReadSstable {
                        stoc_file_id: req.stoc_file_id,
                        sstable_name: req.sstable_name,
                    },
                );
                match self.await_output(rx).await? {
                    TaskOutput::Data(data) => Ok(data),
                    other => Err(unexpected_output(&other)),
                }
            }
            RequestType::Persist => {
                let req = PersistRequest::decode(&mut frame)?;
                let rx = self.submit(
                    from_server,
                    StorageTask::Persist {
                        pairs: req
                            .pairs
                            .into_iter()
                            .map(|(stoc_file_id, sstable_name)| PersistPair {
                                stoc_file_id,
                                sstable_name,
                            })
                            .collect(),
                        is_meta: req.is_meta,
                        seal: false,
                    },
                );
                match self.await_output(rx).await? {
                    TaskOutput::Handles { handles, sealed } => {
                        Ok(PersistResponse { handles, sealed }.encode())
                    }
                    other => Err(unexpected_output(&other)),
                }
            }
            RequestType::Compaction => {
                let req = CompactionRequestFrame::decode(&mut frame)?;
                let rx = self.submit(
                    from_server,
                    StorageTask::Compaction {
                        request: Box::new(req.request),
                    },
                );
                match self.await_output(rx).await? {
                    TaskOutput::Edit(edit) => Ok(CompactionResponse { edit }.encode()),
                    other => Err(unexpected_output(&other)),
                }
            }
            RequestType::DeleteTables => {
                let req = DeleteTablesRequest::decode(&mut frame)?;
                self.submit_no_reply(
                    from_server,
                    StorageTask::DeleteTables {
                        dbname: req.dbname,
                        file_numbers: req.file_numbers,
                    },
                );
                Ok(Bytes::new())
            }
            RequestType::AllocateLogBuffer => {
                let req = AllocateLogBufferRequest::decode(&mut frame)?;
                let buf = self.mem.alloc_for(req.dbid as u64, req.size)?;
                let size = buf.len() as u64;
                let mut buffers = self.log_buffers.lock().unwrap();
                buffers.push(buf);
                Ok(AllocateLogBufferResponse {
                    region_id: buffers.len() as u32,
                    offset: 0,
                    size,
                }
                .encode())
            }
            other => Err(Error::InvalidRequest(format!(
                "opcode {other:?} is not a StoC request"
            ))),
        }
    }
}

fn unexpected_output(output: &TaskOutput) -> Error {
    Error::InvalidRequest(format!("worker returned mismatched output {output:?}"))
}

/// In-process fabric: every node's server registered by id, with failure
/// injection for partition tests.
#[derive(Default)]
pub struct LoopbackNetwork {
    servers: Mutex<HashMap<u32, Arc<StocServer>>>,
    down: Mutex<HashSet<u32>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, server: Arc<StocServer>) {
        self.servers
            .lock()
            .unwrap()
            .insert(server.server_id(), server);
    }

    pub fn fail_server(&self, server_id: u32) {
        warn!(server_id, "loopback: server marked down");
        self.down.lock().unwrap().insert(server_id);
    }

    pub fn heal_server(&self, server_id: u32) {
        self.down.lock().unwrap().remove(&server_id);
    }

    /// A `Transport` bound to the sending node's id.
    pub fn transport(self: &Arc<Self>, from_server: u32) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: Arc::clone(self),
            from_server,
        })
    }

    async fn route(&self, from_server: u32, to_server: u32, frame: Bytes) -> Result<Bytes> {
        if self.down.lock().unwrap().contains(&to_server) {
            return Err(Error::transport(to_server, "server unreachable"));
        }
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&to_server)
            .cloned()
            .ok_or_else(|| Error::transport(to_server, "no such server"))?;
        server.handle_frame(from_server, frame).await
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    from_server: u32,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn call(&self, server_id: u32, frame: Bytes) -> Result<Bytes> {
        self.network.route(self.from_server, server_id, frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockhouse_cluster::{fragment::parse_fragment_map, ClusterOptions};
    use blockhouse_core::StoCBlockHandle;

    fn node_config(tmp: &tempfile::TempDir, server_id: u32) -> Arc<ClusterConfig> {
        let options: ClusterOptions = serde_json::from_value(serde_json::json!({
            "my_server_id": server_id,
            "ltc_servers": [0],
            "stoc_servers": [1, 2, 3],
            "stoc_files_path": tmp.path().join(format!("stoc-{server_id}")),
            "db_path": tmp.path().join(format!("db-{server_id}")),
            "num_storage_workers": 2,
            "num_rdma_server_threads": 2,
        }))
        .unwrap();
        let epochs = parse_fragment_map("config\n0,10000,0,0\n").unwrap();
        ClusterConfig::new(options, epochs).unwrap()
    }

    async fn start_node(
        tmp: &tempfile::TempDir,
        network: &Arc<LoopbackNetwork>,
        server_id: u32,
    ) -> Arc<StocServer> {
        let config = node_config(tmp, server_id);
        let mem = Arc::new(MemManager::new(2, 1 << 30));
        let client = BlockClient::new(server_id, network.transport(server_id));
        let server = StocServer::start(config, client, mem).unwrap();
        network.register(Arc::clone(&server));
        server
    }

    #[tokio::test]
    async fn test_append_then_read_through_server() {
        let tmp = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let _node = start_node(&tmp, &network, 1).await;

        let client = BlockClient::new(0, network.transport(0));
        let req = client
            .initiate_append_block(1, "db-0", 5, Bytes::from_static(b"group bytes!"), false)
            .unwrap();
        let resp = client.wait_for(req).await.unwrap();
        let handle = resp.handles[0];
        assert_eq!(handle.server_id, 1);
        assert_eq!(handle.size, 12);

        let req = client
            .initiate_read_data_block(&handle, handle.offset, handle.size, "db-0/000005")
            .unwrap();
        let data = client.wait_for(req).await.unwrap().data.unwrap();
        assert_eq!(data.as_ref(), b"group bytes!");
    }

    #[tokio::test]
    async fn test_meta_append_seals_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let node = start_node(&tmp, &network, 1).await;

        let client = BlockClient::new(0, network.transport(0));
        let req = client
            .initiate_append_block(1, "db-0", 6, Bytes::from_static(b"meta blob!"), true)
            .unwrap();
        let handle = client.wait_for(req).await.unwrap().handles[0];

        // The persist sealed the dedicated segment; further appends are
        // refused with OutOfSpace.
        let segment = node.manager().find(handle.stoc_file_id).unwrap();
        assert!(segment.is_sealed());
        assert!(matches!(
            segment.append("x", b"y", u64::MAX),
            Err(Error::OutOfSpace { .. })
        ));
    }

    #[tokio::test]
    async fn test_flush_sstable_whole_table() {
        let tmp = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let node = start_node(&tmp, &network, 1).await;

        let client = BlockClient::new(0, network.transport(0));
        let req = client
            .initiate_flush_sstable(1, "db-0", 9, Bytes::from_static(b"entire table"))
            .unwrap();
        let handle = client.wait_for(req).await.unwrap().handles[0];
        assert!(node.manager().find(handle.stoc_file_id).unwrap().is_sealed());

        // Whole-table fetch by name.
        let req = client
            .initiate_read_sstable(1, handle.stoc_file_id, "db-0/000009", false)
            .unwrap();
        let data = client.wait_for(req).await.unwrap().data.unwrap();
        assert_eq!(data.as_ref(), b"entire table");
    }

    #[tokio::test]
    async fn test_persist_frame_returns_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let node = start_node(&tmp, &network, 2).await;

        let (fid, _) = node
            .manager()
            .append("db-1/000003", b"persist me", false)
            .unwrap();
        let client = BlockClient::new(0, network.transport(0));
        let req = client
            .initiate_persist(2, vec![(fid, "db-1/000003".to_string())], false)
            .unwrap();
        let resp = client.wait_for(req).await.unwrap();
        assert_eq!(
            resp.handles[0],
            StoCBlockHandle::new(2, fid, 0, 10)
        );
    }

    #[tokio::test]
    async fn test_delete_tables_is_best_effort() {
        let tmp = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let node = start_node(&tmp, &network, 1).await;

        let client = BlockClient::new(0, network.transport(0));
        let req = client
            .initiate_append_block(1, "db-0", 44, Bytes::from_static(b"doomed"), true)
            .unwrap();
        client.wait_for(req).await.unwrap();
        assert_eq!(node.manager().num_segments(), 1);

        client.initiate_delete_tables(1, "db-0", vec![44]);
        // Fire-and-forget: poll until the worker processed it.
        for _ in 0..100 {
            if node.manager().num_segments() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(node.manager().num_segments(), 0);
    }

    #[tokio::test]
    async fn test_failed_server_unreachable_until_healed() {
        let tmp = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let _node = start_node(&tmp, &network, 1).await;
        network.fail_server(1);

        let client = BlockClient::new(0, network.transport(0));
        let req = client
            .initiate_append_block(1, "db-0", 1, Bytes::from_static(b"x"), false)
            .unwrap();
        assert!(matches!(
            client.wait_for(req).await,
            Err(Error::Transport { server_id: 1, .. })
        ));

        network.heal_server(1);
        let req = client
            .initiate_append_block(1, "db-0", 1, Bytes::from_static(b"x"), false)
            .unwrap();
        assert!(client.wait_for(req).await.is_ok());
    }

    #[tokio::test]
    async fn test_allocate_log_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let _node = start_node(&tmp, &network, 3).await;

        let client = BlockClient::new(0, network.transport(0));
        let req = client.initiate_allocate_log_buffer(3, 0, 64 * 1024).unwrap();
        let resp = client.wait_for(req).await.unwrap();
        assert_eq!(resp.handles.len(), 1);
        assert!(resp.handles[0].size >= 64 * 1024);
    }
}
