//! Block Client: Request Ids and Completion Demux
//!
//! Every logical operation against a StoC gets a request id from a
//! wrap-around counter that skips 0. The id maps to an in-flight
//! `RequestContext`; when the transport completes, the context flips to done
//! and one permit lands on the completion semaphore. `wait()` consumes one
//! permit — callers issue G operations, wait G times, then harvest results
//! with `is_done`, which delivers each response exactly once. A completion
//! for an id that was already harvested (a duplicate re-execution on the
//! StoC) is dropped here, never delivered twice to user code.
//!
//! The `Transport` seam carries opaque frames only. No raw addresses cross
//! it; the completion routing below is the only correlation state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use blockhouse_core::wire::{
    AllocateLogBufferRequest, AllocateLogBufferResponse, AppendBlockRequest, AppendBlockResponse,
    CompactionRequestFrame, CompactionResponse, DeleteTablesRequest, FlushSstableRequest,
    FlushSstableResponse, PersistRequest, PersistResponse, ReadBlocksRequest, ReadSstableRequest,
};
use blockhouse_core::{CompactionRequest, Error, Result, StoCBlockHandle, VersionEdit};

/// Async request issuer over the fabric. Implementations: the real RDMA
/// transport, the in-process loopback used by tests, and no-op doubles.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, server_id: u32, frame: Bytes) -> Result<Bytes>;
}

/// Reads a handle that resolves to this node's own storage, bypassing the
/// fabric entirely.
pub trait LocalBlockReader: Send + Sync {
    fn read_local(&self, handle: &StoCBlockHandle, offset: u64, size: u64) -> Result<Bytes>;
}

/// What kind of operation an in-flight request context represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    FlushSstable,
    ReadBlocks,
    ReadSstable,
    AppendBlock,
    Persist,
    Compaction,
    ReplicateLog,
    DeleteTables,
}

/// Decoded response payload, one variant-agnostic bag like the wire frames
/// that feed it.
#[derive(Debug, Clone, Default)]
pub struct StocResponse {
    pub handles: Vec<StoCBlockHandle>,
    pub data: Option<Bytes>,
    pub edit: Option<VersionEdit>,
}

enum ContextState {
    InFlight { kind: RequestKind },
    Done { result: Result<StocResponse> },
}

struct ClientInner {
    my_server_id: u32,
    transport: Arc<dyn Transport>,
    next_req_id: AtomicU32,
    pending: Mutex<HashMap<u32, ContextState>>,
    completions: Semaphore,
    /// Outstanding requests per peer; the selector's load metric.
    peer_load: Mutex<HashMap<u32, u32>>,
    /// Peers declared failed, with expiry.
    failed: Mutex<HashMap<u32, Instant>>,
    stat_tasks: AtomicU32,
}

/// Cheaply cloneable; all clones share one request-id space and one pending
/// table, matching "one client per connection endpoint".
#[derive(Clone)]
pub struct BlockClient {
    inner: Arc<ClientInner>,
}

impl BlockClient {
    pub fn new(my_server_id: u32, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                my_server_id,
                transport,
                next_req_id: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                completions: Semaphore::new(0),
                peer_load: Mutex::new(HashMap::new()),
                failed: Mutex::new(HashMap::new()),
                stat_tasks: AtomicU32::new(0),
            }),
        }
    }

    pub fn my_server_id(&self) -> u32 {
        self.inner.my_server_id
    }

    /// Foreground task counter for the stats aggregator. Never resets.
    pub fn stat_tasks(&self) -> u32 {
        self.inner.stat_tasks.load(Ordering::Relaxed)
    }

    fn allocate_request_id(&self) -> u32 {
        loop {
            let id = self.inner.next_req_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Declare a peer failed for `duration`. Outstanding requests to it will
    /// surface transport errors; new initiates fail fast until the window
    /// elapses.
    pub fn mark_failed(&self, server_id: u32, duration: Duration) {
        warn!(server_id, ?duration, "declaring peer failed");
        self.inner
            .failed
            .lock()
            .unwrap()
            .insert(server_id, Instant::now() + duration);
    }

    pub fn is_failed(&self, server_id: u32) -> bool {
        let mut failed = self.inner.failed.lock().unwrap();
        match failed.get(&server_id) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                failed.remove(&server_id);
                false
            }
            None => false,
        }
    }

    /// Outstanding requests against one peer.
    pub fn pending_load(&self, server_id: u32) -> u32 {
        *self
            .inner
            .peer_load
            .lock()
            .unwrap()
            .get(&server_id)
            .unwrap_or(&0)
    }

    fn start(&self, server_id: u32, kind: RequestKind, frame: Bytes) -> Result<u32> {
        if self.is_failed(server_id) {
            return Err(Error::PeerFailed { server_id });
        }
        let req_id = self.allocate_request_id();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(req_id, ContextState::InFlight { kind });
        *self
            .inner
            .peer_load
            .lock()
            .unwrap()
            .entry(server_id)
            .or_insert(0) += 1;
        self.inner.stat_tasks.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = match inner.transport.call(server_id, frame).await {
                Ok(raw) => parse_response(kind, raw),
                Err(e) => Err(e),
            };
            complete(&inner, server_id, req_id, result);
        });
        Ok(req_id)
    }

    /// Scatter write: one data-block group or meta blob to `stoc_id`.
    pub fn initiate_append_block(
        &self,
        stoc_id: u32,
        dbname: &str,
        file_number: u64,
        payload: Bytes,
        is_meta: bool,
    ) -> Result<u32> {
        let frame = AppendBlockRequest {
            dbname: dbname.to_string(),
            file_number,
            is_meta,
            payload,
        }
        .encode();
        self.start(stoc_id, RequestKind::AppendBlock, frame)
    }

    /// Whole-table flush to a single StoC; the receiving segment seals.
    pub fn initiate_flush_sstable(
        &self,
        stoc_id: u32,
        dbname: &str,
        file_number: u64,
        payload: Bytes,
    ) -> Result<u32> {
        let frame = FlushSstableRequest {
            dbname: dbname.to_string(),
            file_number,
            payload,
        }
        .encode();
        self.start(stoc_id, RequestKind::FlushSstable, frame)
    }

    /// Read one byte range addressed by a global handle.
    pub fn initiate_read_data_block(
        &self,
        handle: &StoCBlockHandle,
        offset: u64,
        size: u64,
        sstable_name: &str,
    ) -> Result<u32> {
        let frame = ReadBlocksRequest {
            sstable_name: sstable_name.to_string(),
            stoc_file_id: handle.stoc_file_id,
            ranges: vec![(offset, size)],
        }
        .encode();
        self.start(handle.server_id, RequestKind::ReadBlocks, frame)
    }

    /// Fetch a whole named table block when no offsets are known.
    pub fn initiate_read_sstable(
        &self,
        server_id: u32,
        stoc_file_id: u32,
        sstable_name: &str,
        is_meta: bool,
    ) -> Result<u32> {
        let frame = ReadSstableRequest {
            sstable_name: sstable_name.to_string(),
            stoc_file_id,
            is_meta,
        }
        .encode();
        self.start(server_id, RequestKind::ReadSstable, frame)
    }

    pub fn initiate_persist(
        &self,
        stoc_id: u32,
        pairs: Vec<(u32, String)>,
        is_meta: bool,
    ) -> Result<u32> {
        let frame = PersistRequest { is_meta, pairs }.encode();
        self.start(stoc_id, RequestKind::Persist, frame)
    }

    pub fn initiate_compaction(&self, stoc_id: u32, request: CompactionRequest) -> Result<u32> {
        let frame = CompactionRequestFrame { request }.encode();
        self.start(stoc_id, RequestKind::Compaction, frame)
    }

    pub fn initiate_allocate_log_buffer(&self, stoc_id: u32, dbid: u32, size: u64) -> Result<u32> {
        let frame = AllocateLogBufferRequest { dbid, size }.encode();
        self.start(stoc_id, RequestKind::ReplicateLog, frame)
    }

    /// Best-effort table deletion. No request id, no completion tracking, no
    /// retry on peer failure.
    pub fn initiate_delete_tables(&self, stoc_id: u32, dbname: &str, file_numbers: Vec<u64>) {
        if self.is_failed(stoc_id) {
            debug!(stoc_id, "skipping delete-tables to failed peer");
            return;
        }
        let frame = DeleteTablesRequest {
            dbname: dbname.to_string(),
            file_numbers,
        }
        .encode();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.transport.call(stoc_id, frame).await {
                debug!(stoc_id, error = %e, "delete-tables dropped");
            }
        });
    }

    /// Suspend until one outstanding request (any of them) completes.
    pub async fn wait(&self) {
        let permit = self
            .inner
            .completions
            .acquire()
            .await
            .expect("completion semaphore closed");
        permit.forget();
    }

    /// Deliver the response for `req_id` if it has completed. Exactly-once:
    /// a second call for the same id returns `None`.
    pub fn is_done(&self, req_id: u32) -> Option<Result<StocResponse>> {
        let mut pending = self.inner.pending.lock().unwrap();
        match pending.get(&req_id) {
            Some(ContextState::Done { .. }) => match pending.remove(&req_id) {
                Some(ContextState::Done { result }) => Some(result),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    /// Wait for a specific request and deliver its response.
    pub async fn wait_for(&self, req_id: u32) -> Result<StocResponse> {
        loop {
            if let Some(result) = self.is_done(req_id) {
                return result;
            }
            self.wait().await;
        }
    }
}

fn complete(inner: &Arc<ClientInner>, server_id: u32, req_id: u32, result: Result<StocResponse>) {
    let mut pending = inner.pending.lock().unwrap();
    match pending.get(&req_id) {
        Some(ContextState::InFlight { kind }) => {
            let kind = *kind;
            debug!(req_id, server_id, ?kind, "request completed");
            pending.insert(req_id, ContextState::Done { result });
        }
        _ => {
            // Context already harvested or never existed: duplicate
            // completion, dropped without a permit.
            debug!(req_id, server_id, "dropping duplicate completion");
            return;
        }
    }
    drop(pending);
    if let Some(load) = inner.peer_load.lock().unwrap().get_mut(&server_id) {
        *load = load.saturating_sub(1);
    }
    inner.completions.add_permits(1);
}

fn parse_response(kind: RequestKind, mut raw: Bytes) -> Result<StocResponse> {
    match kind {
        RequestKind::AppendBlock => {
            let resp = AppendBlockResponse::decode(&mut raw)?;
            Ok(StocResponse {
                handles: vec![resp.handle],
                ..Default::default()
            })
        }
        RequestKind::FlushSstable => {
            let resp = FlushSstableResponse::decode(&mut raw)?;
            Ok(StocResponse {
                handles: vec![resp.handle],
                ..Default::default()
            })
        }
        RequestKind::ReadBlocks | RequestKind::ReadSstable => Ok(StocResponse {
            data: Some(raw),
            ..Default::default()
        }),
        RequestKind::Persist => {
            let resp = PersistResponse::decode(&mut raw)?;
            Ok(StocResponse {
                handles: resp.handles,
                ..Default::default()
            })
        }
        RequestKind::Compaction => {
            let resp = CompactionResponse::decode(&mut raw)?;
            Ok(StocResponse {
                edit: Some(resp.edit),
                ..Default::default()
            })
        }
        RequestKind::ReplicateLog => {
            let resp = AllocateLogBufferResponse::decode(&mut raw)?;
            Ok(StocResponse {
                handles: vec![StoCBlockHandle::new(0, resp.region_id, resp.offset, resp.size)],
                ..Default::default()
            })
        }
        RequestKind::DeleteTables => Ok(StocResponse::default()),
    }
}
