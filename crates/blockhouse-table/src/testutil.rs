//! In-memory StoC doubles for unit tests.
//!
//! `MemStocTransport` speaks just enough of the wire protocol to stand in
//! for a fleet of StoCs: appends accumulate in per-server byte vectors with
//! real offsets, reads slice them back out. The real segment manager and
//! worker pool live in the storage crate and have their own tests; this
//! double exists so the build/scatter/read paths can be exercised here in
//! isolation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use blockhouse_cluster::{ClusterConfig, ClusterOptions};
use blockhouse_core::wire::{
    AppendBlockRequest, AppendBlockResponse, FlushSstableRequest, FlushSstableResponse,
    ReadBlocksRequest, ReadSstableRequest, RequestType,
};
use blockhouse_core::{wire, Error, Result, StoCBlockHandle};

use crate::client::{BlockClient, Transport};
use crate::filename::sstable_name;
use crate::mem_manager::MemManager;
use crate::scatter::ScatterFile;

#[derive(Default)]
struct MemStoc {
    next_file_id: u32,
    files: HashMap<u32, Vec<u8>>,
    names: HashMap<(String, bool), StoCBlockHandle>,
    data_file: Option<u32>,
}

impl MemStoc {
    fn fresh_file(&mut self) -> u32 {
        self.next_file_id += 1;
        self.files.insert(self.next_file_id, Vec::new());
        self.next_file_id
    }
}

#[derive(Default)]
pub struct MemStocTransport {
    stocs: Mutex<HashMap<u32, MemStoc>>,
    failed: Mutex<HashSet<u32>>,
}

impl MemStocTransport {
    pub fn fail_server(&self, server_id: u32) {
        self.failed.lock().unwrap().insert(server_id);
    }

    pub fn heal_server(&self, server_id: u32) {
        self.failed.lock().unwrap().remove(&server_id);
    }

    /// Raw segment contents, for byte-level assertions.
    pub fn segment(&self, server_id: u32, stoc_file_id: u32) -> Option<Vec<u8>> {
        self.stocs
            .lock()
            .unwrap()
            .get(&server_id)
            .and_then(|s| s.files.get(&stoc_file_id).cloned())
    }
}

#[async_trait]
impl Transport for MemStocTransport {
    async fn call(&self, server_id: u32, mut frame: Bytes) -> Result<Bytes> {
        if self.failed.lock().unwrap().contains(&server_id) {
            return Err(Error::transport(server_id, "server down"));
        }
        let op = wire::peek_opcode(&frame)?;
        let mut stocs = self.stocs.lock().unwrap();
        let stoc = stocs.entry(server_id).or_default();
        match op {
            RequestType::AppendBlock => {
                let req = AppendBlockRequest::decode(&mut frame)?;
                let fid = if req.is_meta {
                    stoc.fresh_file()
                } else {
                    match stoc.data_file {
                        Some(fid) => fid,
                        None => {
                            let fid = stoc.fresh_file();
                            stoc.data_file = Some(fid);
                            fid
                        }
                    }
                };
                let file = stoc.files.get_mut(&fid).expect("file exists");
                let offset = file.len() as u64;
                file.extend_from_slice(&req.payload);
                let handle =
                    StoCBlockHandle::new(server_id, fid, offset, req.payload.len() as u64);
                stoc.names
                    .insert((sstable_name(&req.dbname, req.file_number), req.is_meta), handle);
                Ok(AppendBlockResponse { handle }.encode())
            }
            RequestType::FlushSstable => {
                let req = FlushSstableRequest::decode(&mut frame)?;
                let fid = stoc.fresh_file();
                let file = stoc.files.get_mut(&fid).expect("file exists");
                file.extend_from_slice(&req.payload);
                let handle = StoCBlockHandle::new(server_id, fid, 0, req.payload.len() as u64);
                stoc.names
                    .insert((sstable_name(&req.dbname, req.file_number), false), handle);
                Ok(FlushSstableResponse { handle }.encode())
            }
            RequestType::ReadBlocks => {
                let req = ReadBlocksRequest::decode(&mut frame)?;
                let file = stoc
                    .files
                    .get(&req.stoc_file_id)
                    .ok_or_else(|| Error::corruption("unknown segment"))?;
                let mut out = BytesMut::new();
                for (offset, size) in req.ranges {
                    let end = (offset + size) as usize;
                    if end > file.len() {
                        return Err(Error::corruption("read past segment end"));
                    }
                    out.extend_from_slice(&file[offset as usize..end]);
                }
                Ok(out.freeze())
            }
            RequestType::ReadSstable => {
                let req = ReadSstableRequest::decode(&mut frame)?;
                let handle = stoc
                    .names
                    .get(&(req.sstable_name.clone(), req.is_meta))
                    .copied()
                    .ok_or_else(|| Error::corruption("unknown sstable"))?;
                let file = stoc.files.get(&handle.stoc_file_id).expect("file exists");
                Ok(Bytes::copy_from_slice(
                    &file[handle.offset as usize..(handle.offset + handle.size) as usize],
                ))
            }
            other => Err(Error::InvalidRequest(format!("mock cannot serve {other:?}"))),
        }
    }
}

pub struct TestEnv {
    _tmp: tempfile::TempDir,
    pub config: Arc<ClusterConfig>,
    pub mem: Arc<MemManager>,
    pub client: BlockClient,
    pub transport: Arc<MemStocTransport>,
}

impl TestEnv {
    pub async fn new(num_stocs: u32, scatter_width: usize) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stoc_servers: Vec<u32> = (1..=num_stocs).collect();
        let options: ClusterOptions = serde_json::from_value(serde_json::json!({
            "my_server_id": 0,
            "ltc_servers": [0],
            "stoc_servers": stoc_servers,
            "stoc_files_path": tmp.path().join("stoc"),
            "db_path": tmp.path().join("db"),
            "num_stocs_scatter_data_blocks": scatter_width,
            "scatter_policy": "random",
        }))
        .expect("options");
        let epochs =
            blockhouse_cluster::fragment::parse_fragment_map("config\n0,10000,0,0\n").unwrap();
        let config = ClusterConfig::new(options, epochs).unwrap();
        let transport = Arc::new(MemStocTransport::default());
        let client = BlockClient::new(0, transport.clone() as Arc<dyn Transport>);
        Self {
            _tmp: tmp,
            config,
            mem: Arc::new(MemManager::new(4, 1 << 30)),
            client,
            transport,
        }
    }

    pub fn scatter_file(&self, dbname: &str, file_number: u64, file_size: u64) -> ScatterFile {
        ScatterFile::new(
            Arc::clone(&self.mem),
            self.client.clone(),
            Arc::clone(&self.config),
            dbname,
            file_number,
            0,
            file_size,
            42,
        )
        .expect("scatter file")
    }
}
