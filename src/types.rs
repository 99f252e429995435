//! Configuration and statistics types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Tuning knobs shared by superblocks, indexes and volumes.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum needle data size in bytes
    pub needle_max_size: usize,
    /// Superblock preallocation in bytes, 0 disables
    pub preallocate: u64,
    /// Superblock write buffer capacity
    pub block_buffer_size: usize,
    /// fsync the superblock every N flushes
    pub block_sync_write: usize,
    /// Index ring buffer capacity
    pub index_ring_size: usize,
    /// Index append coalescing buffer in bytes
    pub index_buffer_size: usize,
    /// Signal the index drain thread once this many entries are buffered
    pub index_merge_write: usize,
    /// Drain the index ring at least this often
    pub index_merge_delay: Duration,
    /// fsync the index every N flushes
    pub index_sync_write: usize,
    /// Delete queue capacity
    pub del_queue_size: usize,
    /// Flip delete flags once this many offsets are batched
    pub del_batch: usize,
    /// Flush batched deletes at least this often
    pub del_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            needle_max_size: 5 * 1024 * 1024,
            preallocate: 0,
            block_buffer_size: 64 * 1024,
            block_sync_write: 1024,
            index_ring_size: 4096,
            index_buffer_size: 8 * 1024,
            index_merge_write: 64,
            index_merge_delay: Duration::from_secs(10),
            index_sync_write: 64,
            del_queue_size: 1024,
            del_batch: 32,
            del_delay: Duration::from_secs(1),
        }
    }
}

/// Per-volume operation counters.
#[derive(Debug, Default)]
pub struct VolumeStats {
    pub reads: AtomicU64,
    pub read_bytes: AtomicU64,
    pub writes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub deletes: AtomicU64,
}

impl VolumeStats {
    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }
}
