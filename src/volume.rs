//! Volume: a superblock, its index and an in-memory needle cache.
//!
//! Reads resolve a key through the cache and hit the superblock with one
//! positioned read. Writes append to the superblock under a write lock and
//! queue the index entry for the write-behind drain. Deletes flip the
//! cache entry immediately and hand the on-disk flag flip to a background
//! flusher. Compaction copies live needles into a destination volume while
//! reads and writes continue, then swaps cores under the write lock.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::needle::{self, CACHE_DEL_OFFSET, Flag, Needle};
use crate::superblock::{BlockDeleter, SuperBlock};
use crate::index::Indexer;
use crate::types::{StoreConfig, VolumeStats};

enum DelCommand {
    Del(u32),
    Finish,
}

/// Mutable state guarded by the volume lock. Swapped wholesale when a
/// compaction finishes.
struct VolumeCore {
    block: SuperBlock,
    indexer: Indexer,
    /// key -> packed (offset, size); offset 0 marks a deleted needle.
    needles: HashMap<i64, i64>,
}

#[derive(Default)]
struct CompactState {
    running: bool,
    /// Resume cursor for the copy-forward scan, in 8-byte units.
    offset: u32,
    /// Keys deleted while the scan was running, replayed on stop.
    keys: Vec<i64>,
}

/// One addressable storage volume.
pub struct Volume {
    id: u32,
    conf: Arc<StoreConfig>,
    core: Arc<RwLock<VolumeCore>>,
    del_tx: Mutex<Sender<DelCommand>>,
    del_job: Mutex<Option<JoinHandle<()>>>,
    // lock order: compact before core
    compact: Mutex<CompactState>,
    stats: Arc<VolumeStats>,
    closed: AtomicBool,
}

impl Volume {
    /// Open a volume, running two-phase recovery: replay the index to seed
    /// the cache, then scan the superblock past the index's last covered
    /// offset, rebuilding index entries for whatever it finds.
    pub fn open<P: AsRef<Path>>(
        id: u32,
        block_path: P,
        index_path: P,
        conf: StoreConfig,
    ) -> Result<Self> {
        let conf = Arc::new(conf);
        let mut block = SuperBlock::open(block_path, conf.clone())?;
        let mut indexer = Indexer::open(index_path, conf.clone())?;

        let mut needles = HashMap::new();
        let mut offset = 0u32;
        indexer.recovery(|e| {
            needles.insert(e.key, needle::cache_pack(e.offset, e.size));
            offset = e.offset + needle::needle_offset(u64::from(e.size as u32));
            Ok(())
        })?;
        if needle::block_offset(offset) > block.size() {
            warn!(
                "Volume {} index covers offset {} beyond block size {}, rebuilding from scan",
                id,
                offset,
                block.size()
            );
            needles.clear();
            offset = 0;
            // the stale records must not survive as a prefix, or the next
            // reopen replays them ahead of the rebuilt entries
            indexer.truncate()?;
        }
        block.recovery(offset, |n, so, _eo| {
            if n.flag == Flag::Ok {
                indexer.write(n.key, so, n.total_size)?;
                needles.insert(n.key, needle::cache_pack(so, n.total_size));
            } else {
                needles.insert(n.key, needle::cache_pack(CACHE_DEL_OFFSET, n.total_size));
            }
            Ok(())
        })?;
        indexer.flush()?;
        indexer.start()?;

        let deleter = block.deleter()?;
        let stats = Arc::new(VolumeStats::default());
        let (del_tx, del_rx) = bounded(conf.del_queue_size);
        let del_job = spawn_del_flusher(id, deleter, del_rx, conf.clone())?;
        info!("Opened volume {}, {} needles cached", id, needles.len());
        Ok(Self {
            id,
            conf,
            core: Arc::new(RwLock::new(VolumeCore {
                block,
                indexer,
                needles,
            })),
            del_tx: Mutex::new(del_tx),
            del_job: Mutex::new(Some(del_job)),
            compact: Mutex::new(CompactState::default()),
            stats,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stats(&self) -> &VolumeStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of cached keys, deleted entries included.
    pub fn needle_count(&self) -> usize {
        self.core.read().needles.len()
    }

    /// Read the needle stored under `key`, validating cookie, key and
    /// liveness against the on-disk record. A record found deleted on disk
    /// but live in the cache heals the cache entry.
    pub fn read(&self, key: i64, cookie: i32) -> Result<Needle> {
        if self.is_closed() {
            return Err(StoreError::VolumeClosed);
        }
        let (size, buf) = {
            let core = self.core.read();
            let nc = *core
                .needles
                .get(&key)
                .ok_or(StoreError::NeedleNotExist(key))?;
            let (offset, size) = needle::cache_unpack(nc);
            if offset == CACHE_DEL_OFFSET {
                return Err(StoreError::NeedleDeleted(key));
            }
            let mut buf = vec![0u8; size as usize];
            core.block.get(offset, &mut buf)?;
            (size, buf)
        };
        let n = Needle::parse_bytes(&buf)?;
        if n.key != key {
            return Err(StoreError::NeedleKey {
                expected: key,
                actual: n.key,
            });
        }
        if n.flag == Flag::Deleted {
            // disk is authoritative, heal the stale cache entry
            debug!("Volume {} healing stale cache entry for key {}", self.id, key);
            self.core
                .write()
                .needles
                .insert(key, needle::cache_pack(CACHE_DEL_OFFSET, size));
            return Err(StoreError::NeedleDeleted(key));
        }
        if n.cookie != cookie {
            return Err(StoreError::NeedleCookie(key));
        }
        self.stats.record_read(size as u64);
        Ok(n)
    }

    /// Append one needle and publish it. Overwriting a live key queues an
    /// asynchronous delete of the old record.
    pub fn write(&self, n: &Needle) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::VolumeClosed);
        }
        if n.data.len() > self.conf.needle_max_size {
            return Err(StoreError::NeedleTooLarge(n.data.len()));
        }
        {
            // held across the enqueue so a retired offset cannot cross a
            // compaction core swap into the wrong delete queue
            let _cs = self.compact.lock();
            let old = {
                let mut guard = self.core.write();
                let core = &mut *guard;
                let offset = core.block.offset();
                core.block.add(n)?;
                core.indexer.add(n.key, offset, n.total_size)?;
                core.needles
                    .insert(n.key, needle::cache_pack(offset, n.total_size))
            };
            self.retire(n.key, old)?;
        }
        self.stats.record_write(n.total_size as u64);
        Ok(())
    }

    /// Append a batch under one lock acquisition and one flush.
    pub fn writes(&self, ns: &[Needle]) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::VolumeClosed);
        }
        for n in ns {
            if n.data.len() > self.conf.needle_max_size {
                return Err(StoreError::NeedleTooLarge(n.data.len()));
            }
        }
        {
            let _cs = self.compact.lock();
            let mut olds = Vec::new();
            {
                let mut guard = self.core.write();
                let core = &mut *guard;
                let mut res = Ok(());
                for n in ns {
                    let offset = match core.block.write(n) {
                        Ok(offset) => offset,
                        Err(e) => {
                            res = Err(e);
                            break;
                        }
                    };
                    if let Err(e) = core.indexer.add(n.key, offset, n.total_size) {
                        res = Err(e);
                        break;
                    }
                    if let Some(old) =
                        core.needles
                            .insert(n.key, needle::cache_pack(offset, n.total_size))
                    {
                        olds.push((n.key, old));
                    }
                }
                // records already published to the cache must be readable
                // even when the batch fails midway
                let flushed = core.block.flush();
                res?;
                flushed?;
            }
            for (key, old) in olds {
                self.retire(key, Some(old))?;
            }
        }
        for n in ns {
            self.stats.record_write(n.total_size as u64);
        }
        Ok(())
    }

    /// Queue a delete for a previous cache value, if it pointed at a live
    /// record. Callers hold the compact lock, pinning the delete queue to
    /// the block the offset was captured from.
    fn retire(&self, key: i64, old: Option<i64>) -> Result<()> {
        if let Some(nc) = old {
            let (offset, _) = needle::cache_unpack(nc);
            if offset != CACHE_DEL_OFFSET {
                debug!("Volume {} overwrote key {}, retiring offset {}", self.id, key, offset);
                self.async_del(offset)?;
            }
        }
        Ok(())
    }

    /// Mark `key` deleted. The cache flips immediately; the on-disk flag
    /// flip is queued to the delete flusher. Deleting a deleted or absent
    /// key fails.
    pub fn delete(&self, key: i64) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::VolumeClosed);
        }
        {
            let mut cs = self.compact.lock();
            let offset = {
                let mut guard = self.core.write();
                let nc = *guard
                    .needles
                    .get(&key)
                    .ok_or(StoreError::NeedleNotExist(key))?;
                let (offset, size) = needle::cache_unpack(nc);
                if offset == CACHE_DEL_OFFSET {
                    return Err(StoreError::NeedleDeleted(key));
                }
                guard
                    .needles
                    .insert(key, needle::cache_pack(CACHE_DEL_OFFSET, size));
                offset
            };
            if cs.running {
                cs.keys.push(key);
            }
            // still under the compact lock, same reasoning as write()
            self.async_del(offset)?;
        }
        self.stats.record_delete();
        Ok(())
    }

    fn async_del(&self, offset: u32) -> Result<()> {
        self.del_tx
            .lock()
            .try_send(DelCommand::Del(offset))
            .map_err(|_| StoreError::DelQueueFull)
    }

    /// Copy live needles into `dst` from the start of the superblock,
    /// without blocking reads or writes on this volume. Deletes arriving
    /// during the scan are recorded for replay by
    /// [`stop_compact`](Self::stop_compact).
    pub fn start_compact(&self, dst: &Volume) -> Result<()> {
        {
            let mut cs = self.compact.lock();
            if cs.running {
                return Err(StoreError::VolumeInCompact);
            }
            cs.running = true;
            cs.offset = 0;
            cs.keys.clear();
        }
        info!("Volume {} compaction started into volume {}", self.id, dst.id);
        if let Err(e) = self.compact_pass(dst) {
            let mut cs = self.compact.lock();
            cs.running = false;
            cs.offset = 0;
            cs.keys.clear();
            return Err(e);
        }
        Ok(())
    }

    fn compact_pass(&self, dst: &Volume) -> Result<()> {
        // private handle, the scan must not disturb the live read cursor
        let path = self.core.read().block.path().to_path_buf();
        let f = File::open(&path)?;
        SuperBlock::scan_file(&f, 0, |n, _so, eo| {
            if n.flag == Flag::Ok {
                dst.write(&n)?;
            }
            self.compact.lock().offset = eo;
            Ok(())
        })?;
        Ok(())
    }

    /// Finish a compaction: catch up on the tail written since the scan,
    /// replay deletes recorded during it, then swap `dst`'s core in as this
    /// volume's live state. `dst` is consumed; its previous core (the old
    /// block and index) is closed.
    pub fn stop_compact(&self, dst: Volume) -> Result<()> {
        let mut cs = self.compact.lock();
        if !cs.running {
            return Err(StoreError::VolumeNotInCompact);
        }
        {
            let mut guard = self.core.write();
            let mut end = cs.offset;
            guard.block.compact(cs.offset, |n, _so, eo| {
                if n.flag == Flag::Ok {
                    dst.write(&n)?;
                }
                end = eo;
                Ok(())
            })?;
            cs.offset = end;
            for key in cs.keys.drain(..) {
                match dst.delete(key) {
                    Ok(()) | Err(StoreError::NeedleNotExist(_) | StoreError::NeedleDeleted(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            // the old block gets its remaining flag flips, then the
            // flusher exits and dst's flusher takes over
            self.shutdown_del_job();
            {
                let mut dst_core = dst.core.write();
                std::mem::swap(&mut *guard, &mut *dst_core);
            }
            std::mem::swap(&mut *self.del_tx.lock(), &mut *dst.del_tx.lock());
            *self.del_job.lock() = dst.del_job.lock().take();
            dst.closed.store(true, Ordering::Release);
            // retire the old core, now parked in dst
            let mut old = dst.core.write();
            if let Err(e) = old.indexer.close() {
                warn!("Volume {} failed to close old index: {}", self.id, e);
            }
            if let Err(e) = old.block.close() {
                warn!("Volume {} failed to close old superblock: {}", self.id, e);
            }
        }
        cs.running = false;
        cs.offset = 0;
        info!("Volume {} compaction finished", self.id);
        Ok(())
    }

    fn shutdown_del_job(&self) {
        let _ = self.del_tx.lock().send(DelCommand::Finish);
        if let Some(handle) = self.del_job.lock().take() {
            if handle.join().is_err() {
                warn!("Volume {} delete flusher panicked", self.id);
            }
        }
    }

    /// Stop background jobs, flush and fsync everything. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown_del_job();
        let mut guard = self.core.write();
        let core = &mut *guard;
        core.indexer.close()?;
        core.block.close()?;
        info!("Closed volume {}", self.id);
        Ok(())
    }

    /// Close and remove the backing files.
    pub fn destroy(self) -> Result<()> {
        self.close()?;
        let (block_path, index_path) = {
            let core = self.core.read();
            (
                core.block.path().to_path_buf(),
                core.indexer.path().to_path_buf(),
            )
        };
        std::fs::remove_file(block_path)?;
        std::fs::remove_file(index_path)?;
        info!("Destroyed volume {}", self.id);
        Ok(())
    }
}

/// Background thread that batches queued offsets, sorts them for
/// sequential access and flips the on-disk delete flags.
fn spawn_del_flusher(
    id: u32,
    deleter: BlockDeleter,
    rx: Receiver<DelCommand>,
    conf: Arc<StoreConfig>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("volume-{id}-del"))
        .spawn(move || {
            debug!("Volume {} delete flusher started", id);
            let mut offsets: Vec<u32> = Vec::new();
            loop {
                let exit = match rx.recv_timeout(conf.del_delay) {
                    Ok(DelCommand::Del(offset)) => {
                        offsets.push(offset);
                        if offsets.len() < conf.del_batch {
                            continue;
                        }
                        false
                    }
                    Ok(DelCommand::Finish) => {
                        while let Ok(DelCommand::Del(offset)) = rx.try_recv() {
                            offsets.push(offset);
                        }
                        true
                    }
                    Err(RecvTimeoutError::Disconnected) => true,
                    Err(RecvTimeoutError::Timeout) => false,
                };
                if !offsets.is_empty() {
                    offsets.sort_unstable();
                    for &offset in &offsets {
                        if let Err(e) = deleter.del(offset) {
                            warn!("Volume {} delete at offset {} failed: {}", id, offset, e);
                            break;
                        }
                    }
                    offsets.clear();
                }
                if exit {
                    break;
                }
            }
            debug!("Volume {} delete flusher exited", id);
        })?;
    Ok(handle)
}
