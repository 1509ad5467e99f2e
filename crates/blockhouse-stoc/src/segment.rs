//! Persistent Segment Files
//!
//! A segment is an append-only, sealable blob on one StoC. Data-block
//! groups from many SSTables share an open data segment until it hits the
//! size cap; a metadata blob (or a whole flushed table) always gets a
//! dedicated segment that seals at its first persist.
//!
//! `append_offset` is published only after the bytes are in place, so
//! readers race appends safely without a lock on the read path. The block
//! index per segment is guarded by the segment's own mutex.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info};

use blockhouse_core::{BlockHandle, Error, Result, StoCBlockHandle};
use blockhouse_table::LocalBlockReader;

#[derive(Debug, Default)]
struct SegmentIndex {
    sealed: bool,
    persisted_offset: u64,
    live_bytes: u64,
    /// All blocks appended under each sstable name, append order.
    blocks: HashMap<String, Vec<BlockHandle>>,
}

#[derive(Debug)]
pub struct StocPersistentFile {
    id: u32,
    path: PathBuf,
    file: File,
    /// Monotonic; stored atomically so readers never lock.
    append_offset: AtomicU64,
    index: Mutex<SegmentIndex>,
}

impl StocPersistentFile {
    fn create(id: u32, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            id,
            path,
            file,
            append_offset: AtomicU64::new(0),
            index: Mutex::new(SegmentIndex::default()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn append_offset(&self) -> u64 {
        self.append_offset.load(Ordering::Acquire)
    }

    pub fn is_sealed(&self) -> bool {
        self.index.lock().unwrap().sealed
    }

    /// Append `bytes` for `sstable_name`, respecting `max_size`. One writer
    /// at a time; the offset is published after the write lands.
    pub fn append(&self, sstable_name: &str, bytes: &[u8], max_size: u64) -> Result<BlockHandle> {
        let mut index = self.index.lock().unwrap();
        let offset = self.append_offset.load(Ordering::Acquire);
        let needed = bytes.len() as u64;
        if index.sealed || offset + needed > max_size {
            return Err(Error::OutOfSpace {
                stoc_file_id: self.id,
                needed,
                available: if index.sealed { 0 } else { max_size.saturating_sub(offset) },
            });
        }
        self.file.write_all_at(bytes, offset)?;
        self.append_offset.store(offset + needed, Ordering::Release);
        let handle = BlockHandle::new(offset, needed);
        index
            .blocks
            .entry(sstable_name.to_string())
            .or_default()
            .push(handle);
        index.live_bytes += needed;
        Ok(handle)
    }

    /// Fsync up to the current append offset; returns newly durable bytes.
    pub fn persist(&self) -> Result<u64> {
        self.file.sync_data()?;
        let mut index = self.index.lock().unwrap();
        let offset = self.append_offset.load(Ordering::Acquire);
        let newly = offset - index.persisted_offset;
        index.persisted_offset = offset;
        Ok(newly)
    }

    pub fn force_seal(&self) {
        let mut index = self.index.lock().unwrap();
        if !index.sealed {
            index.sealed = true;
            debug!(segment = self.id, "segment sealed");
        }
    }

    /// Read the full byte range or fail; no partial reads. Only published
    /// bytes are readable.
    pub fn read(&self, offset: u64, size: u64) -> Result<Bytes> {
        if offset + size > self.append_offset() {
            return Err(Error::corruption(format!(
                "read [{offset}, +{size}) past end of segment {}",
                self.id
            )));
        }
        let mut out = vec![0u8; size as usize];
        self.file.read_exact_at(&mut out, offset)?;
        Ok(Bytes::from(out))
    }

    /// The last block appended under `sstable_name`.
    pub fn handle(&self, sstable_name: &str) -> Option<BlockHandle> {
        self.index
            .lock()
            .unwrap()
            .blocks
            .get(sstable_name)
            .and_then(|blocks| blocks.last().copied())
    }

    /// Drop every block of `sstable_name`; true when the segment is sealed
    /// and holds no live bytes afterwards.
    fn delete_sstable(&self, sstable_name: &str) -> bool {
        let mut index = self.index.lock().unwrap();
        if let Some(blocks) = index.blocks.remove(sstable_name) {
            let freed: u64 = blocks.iter().map(|b| b.size).sum();
            index.live_bytes -= freed;
        }
        index.sealed && index.live_bytes == 0
    }
}

/// All segments on one StoC node.
#[derive(Debug)]
pub struct StocFileManager {
    server_id: u32,
    root: PathBuf,
    max_segment_size: u64,
    next_file_id: AtomicU32,
    files: Mutex<HashMap<u32, Arc<StocPersistentFile>>>,
    current_data: Mutex<Option<Arc<StocPersistentFile>>>,
}

impl StocFileManager {
    pub fn new(server_id: u32, root: PathBuf, max_segment_size: u64) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&root)?;
        Ok(Arc::new(Self {
            server_id,
            root,
            max_segment_size,
            next_file_id: AtomicU32::new(1),
            files: Mutex::new(HashMap::new()),
            current_data: Mutex::new(None),
        }))
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    fn open_segment(&self) -> Result<Arc<StocPersistentFile>> {
        // Id 0 is reserved to mean "local file"; ids start at 1.
        let id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let path = self.root.join(format!("{id}"));
        let segment = Arc::new(StocPersistentFile::create(id, path)?);
        self.files.lock().unwrap().insert(id, Arc::clone(&segment));
        Ok(segment)
    }

    /// Append a block. `dedicated` (meta blobs, whole flushed tables) opens
    /// a fresh segment; data groups share the open data segment until it
    /// runs out of room.
    pub fn append(
        &self,
        sstable_name: &str,
        bytes: &[u8],
        dedicated: bool,
    ) -> Result<(u32, BlockHandle)> {
        if dedicated {
            let segment = self.open_segment()?;
            let cap = self.max_segment_size.max(bytes.len() as u64);
            let handle = segment.append(sstable_name, bytes, cap)?;
            return Ok((segment.id(), handle));
        }
        let mut current = self.current_data.lock().unwrap();
        if let Some(segment) = current.as_ref() {
            match segment.append(sstable_name, bytes, self.max_segment_size) {
                Ok(handle) => return Ok((segment.id(), handle)),
                Err(Error::OutOfSpace { .. }) => {
                    debug!(segment = segment.id(), "data segment full, rolling");
                }
                Err(e) => return Err(e),
            }
        }
        let segment = self.open_segment()?;
        let handle = segment.append(sstable_name, bytes, self.max_segment_size)?;
        *current = Some(Arc::clone(&segment));
        Ok((segment.id(), handle))
    }

    pub fn find(&self, stoc_file_id: u32) -> Result<Arc<StocPersistentFile>> {
        self.files
            .lock()
            .unwrap()
            .get(&stoc_file_id)
            .cloned()
            .ok_or_else(|| Error::corruption(format!("unknown segment {stoc_file_id}")))
    }

    pub fn persist(&self, stoc_file_id: u32) -> Result<u64> {
        self.find(stoc_file_id)?.persist()
    }

    pub fn force_seal(&self, stoc_file_id: u32) -> Result<()> {
        self.find(stoc_file_id)?.force_seal();
        Ok(())
    }

    pub fn read(&self, stoc_file_id: u32, offset: u64, size: u64) -> Result<Bytes> {
        self.find(stoc_file_id)?.read(offset, size)
    }

    /// Global handle for the last block appended under `sstable_name` in
    /// one segment.
    pub fn stoc_block_handle(&self, stoc_file_id: u32, sstable_name: &str) -> Result<StoCBlockHandle> {
        let segment = self.find(stoc_file_id)?;
        let handle = segment.handle(sstable_name).ok_or_else(|| {
            Error::corruption(format!("{sstable_name} not in segment {stoc_file_id}"))
        })?;
        Ok(StoCBlockHandle::new(
            self.server_id,
            stoc_file_id,
            handle.offset,
            handle.size,
        ))
    }

    /// Remove a table's blocks everywhere; unlink sealed segments that end
    /// up empty.
    pub fn delete_sstable(&self, sstable_name: &str) {
        let mut files = self.files.lock().unwrap();
        let mut dead = Vec::new();
        for (id, segment) in files.iter() {
            if segment.delete_sstable(sstable_name) {
                dead.push(*id);
            }
        }
        for id in dead {
            if let Some(segment) = files.remove(&id) {
                info!(segment = id, "unlinking empty sealed segment");
                let _ = std::fs::remove_file(&segment.path);
            }
        }
    }

    pub fn num_segments(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

impl LocalBlockReader for StocFileManager {
    fn read_local(&self, handle: &StoCBlockHandle, offset: u64, size: u64) -> Result<Bytes> {
        self.read(handle.stoc_file_id, offset, size)
    }
}
