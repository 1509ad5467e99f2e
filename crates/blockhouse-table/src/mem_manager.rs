//! Pinned Buffer Slabs
//!
//! RDMA traffic wants registered memory, and registration is expensive, so
//! buffers come from a slab pool carved into power-of-two size classes.
//! Free lists are kept per thread slot: a worker that frees on the thread it
//! allocated from hits its local list without contending with anyone else.
//!
//! A `PinnedBuf` is exclusively owned by the allocating thread for its whole
//! lifetime — build → scatter → finalize — and is returned with an explicit
//! `free`. There is no shared ownership and no reference counting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use blockhouse_core::{Error, Result};

const MIN_CLASS_SIZE: u64 = 4 * 1024;
const MAX_CLASS_SIZE: u64 = 256 * 1024 * 1024;

/// A fixed-size buffer from the registered pool.
#[derive(Debug)]
pub struct PinnedBuf {
    data: Box<[u8]>,
    scid: usize,
}

impl PinnedBuf {
    pub fn scid(&self) -> usize {
        self.scid
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug)]
pub struct MemManager {
    class_sizes: Vec<u64>,
    pool_cap: u64,
    allocated: AtomicU64,
    /// `slots[thread_slot][scid]` is that slot's free list for a class.
    slots: Vec<Mutex<Vec<Vec<Box<[u8]>>>>>,
}

impl MemManager {
    pub fn new(num_thread_slots: usize, pool_cap: u64) -> Self {
        let mut class_sizes = Vec::new();
        let mut size = MIN_CLASS_SIZE;
        while size <= MAX_CLASS_SIZE {
            class_sizes.push(size);
            size *= 2;
        }
        let nclasses = class_sizes.len();
        let slots = (0..num_thread_slots.max(1))
            .map(|_| Mutex::new(vec![Vec::new(); nclasses]))
            .collect();
        Self {
            class_sizes,
            pool_cap,
            allocated: AtomicU64::new(0),
            slots,
        }
    }

    /// Smallest class that fits `size` bytes.
    pub fn slab_class_id(&self, size: u64) -> Result<usize> {
        self.class_sizes
            .iter()
            .position(|&c| c >= size)
            .ok_or(Error::OutOfMemory(size))
    }

    pub fn class_size(&self, scid: usize) -> u64 {
        self.class_sizes[scid]
    }

    pub fn alloc(&self, thread_id: u64, scid: usize) -> Result<PinnedBuf> {
        let slot = (thread_id as usize) % self.slots.len();
        {
            let mut lists = self.slots[slot].lock().unwrap();
            if let Some(data) = lists[scid].pop() {
                return Ok(PinnedBuf { data, scid });
            }
        }
        let size = self.class_sizes[scid];
        // No reserved buffer available: grow the pool if the cap allows.
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            if current + size > self.pool_cap {
                return Err(Error::OutOfMemory(size));
            }
            match self.allocated.compare_exchange_weak(
                current,
                current + size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(PinnedBuf {
            data: vec![0u8; size as usize].into_boxed_slice(),
            scid,
        })
    }

    /// Convenience: class lookup plus alloc.
    pub fn alloc_for(&self, thread_id: u64, size: u64) -> Result<PinnedBuf> {
        let scid = self.slab_class_id(size)?;
        self.alloc(thread_id, scid)
    }

    /// Return a buffer to the freeing thread's local list. The bytes stay
    /// registered and are handed out again by `alloc`.
    pub fn free(&self, thread_id: u64, buf: PinnedBuf) {
        let slot = (thread_id as usize) % self.slots.len();
        let mut lists = self.slots[slot].lock().unwrap();
        lists[buf.scid].push(buf.data);
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_sizes_cover_requests() {
        let mm = MemManager::new(2, 1 << 30);
        assert_eq!(mm.class_size(mm.slab_class_id(1).unwrap()), MIN_CLASS_SIZE);
        assert_eq!(mm.class_size(mm.slab_class_id(4096).unwrap()), 4096);
        assert_eq!(mm.class_size(mm.slab_class_id(4097).unwrap()), 8192);
        assert!(mm.slab_class_id(MAX_CLASS_SIZE + 1).is_err());
    }

    #[test]
    fn test_alloc_free_reuses_buffer() {
        let mm = MemManager::new(1, 1 << 20);
        let scid = mm.slab_class_id(4096).unwrap();
        let buf = mm.alloc(0, scid).unwrap();
        assert_eq!(buf.len(), 4096);
        mm.free(0, buf);
        let before = mm.allocated_bytes();
        let _again = mm.alloc(0, scid).unwrap();
        // Second alloc came off the free list, not the pool.
        assert_eq!(mm.allocated_bytes(), before);
    }

    #[test]
    fn test_pool_cap_enforced() {
        let mm = MemManager::new(1, 8 * 1024);
        let scid = mm.slab_class_id(4096).unwrap();
        let _a = mm.alloc(0, scid).unwrap();
        let _b = mm.alloc(0, scid).unwrap();
        assert!(matches!(mm.alloc(0, scid), Err(Error::OutOfMemory(_))));
    }

    #[test]
    fn test_thread_slots_are_independent() {
        let mm = MemManager::new(4, 1 << 20);
        let scid = mm.slab_class_id(4096).unwrap();
        let buf = mm.alloc(7, scid).unwrap();
        mm.free(7, buf);
        // Slot 3 (7 % 4) holds the freed buffer; slot 0 does not.
        let before = mm.allocated_bytes();
        let _other = mm.alloc(0, scid).unwrap();
        assert!(mm.allocated_bytes() > before);
    }

    #[test]
    fn test_buffer_is_writable() {
        let mm = MemManager::new(1, 1 << 20);
        let mut buf = mm.alloc_for(0, 100).unwrap();
        buf.as_mut_slice()[0] = 0xAB;
        buf.as_mut_slice()[99] = 0xCD;
        assert_eq!(buf.as_slice()[0], 0xAB);
    }
}
