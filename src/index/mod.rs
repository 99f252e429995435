//! Write-behind needle index.
//!
//! The index file is a flat log of fixed 16-byte records (key, offset,
//! size) describing live needles in a superblock. Appends are buffered in
//! a ring and drained to disk by a background thread, so index persistence
//! never sits on the write path. The superblock remains the source of
//! truth; a stale index only slows recovery down.

mod ring;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::needle;
use crate::types::StoreConfig;

use ring::Ring;

/// On-disk index record size: key + offset + size.
pub const RECORD_SIZE: usize = 8 + 4 + 4;

/// One index record: where a needle lives in the superblock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: i64,
    /// Record start in 8-byte units.
    pub offset: u32,
    /// Full record size in bytes.
    pub size: i32,
}

impl IndexEntry {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        // Vec<u8> writes cannot fail
        let _ = buf.write_i64::<BigEndian>(self.key);
        let _ = buf.write_u32::<BigEndian>(self.offset);
        let _ = buf.write_i32::<BigEndian>(self.size);
    }

    fn parse(buf: &[u8], max_size: i32) -> Result<Self> {
        let entry = Self {
            key: BigEndian::read_i64(&buf[0..8]),
            offset: BigEndian::read_u32(&buf[8..12]),
            size: BigEndian::read_i32(&buf[12..16]),
        };
        if entry.size < 1 || entry.size > max_size {
            return Err(StoreError::IndexSize(entry.size));
        }
        Ok(entry)
    }
}

enum Signal {
    Ready,
    Finish,
}

/// Append state for the index file. Writes go through a coalescing buffer
/// at `wpos`, which recovery repositions over any trailing garbage.
struct IndexFile {
    f: std::fs::File,
    buf: Vec<u8>,
    wpos: u64,
    flush_count: usize,
    conf: Arc<StoreConfig>,
}

impl IndexFile {
    fn append(&mut self, entry: &IndexEntry) -> Result<()> {
        entry.encode_into(&mut self.buf);
        if self.buf.len() >= self.conf.index_buffer_size {
            self.write_out()?;
        }
        Ok(())
    }

    fn write_out(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.f.write_all_at(&self.buf, self.wpos)?;
            self.wpos += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    fn flush(&mut self, force: bool) -> Result<()> {
        self.write_out()?;
        self.flush_count += 1;
        if force || self.flush_count >= self.conf.index_sync_write {
            self.flush_count = 0;
            self.f.sync_data()?;
        }
        Ok(())
    }
}

struct Shared {
    path: PathBuf,
    ring: Mutex<Ring>,
    file: Mutex<IndexFile>,
    conf: Arc<StoreConfig>,
}

/// Write-behind index over a flat record log.
pub struct Indexer {
    shared: Arc<Shared>,
    tx: Sender<Signal>,
    rx: Option<Receiver<Signal>>,
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl Indexer {
    /// Open an index file, creating it if absent. The drain thread is not
    /// running yet; call [`recovery`](Self::recovery) then
    /// [`start`](Self::start).
    pub fn open<P: AsRef<Path>>(path: P, conf: Arc<StoreConfig>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let (tx, rx) = bounded(1);
        debug!("Opened index {:?}", path);
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                ring: Mutex::new(Ring::new(conf.index_ring_size)),
                file: Mutex::new(IndexFile {
                    f,
                    buf: Vec::with_capacity(conf.index_buffer_size),
                    wpos: 0,
                    flush_count: 0,
                    conf: conf.clone(),
                }),
                conf,
            }),
            tx,
            rx: Some(rx),
            handle: None,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Replay index records in file order. Stops at the first record that
    /// does not parse and repositions the write cursor there, so later
    /// appends overwrite the garbage.
    pub fn recovery<F>(&mut self, mut cb: F) -> Result<()>
    where
        F: FnMut(&IndexEntry) -> Result<()>,
    {
        let max_size = needle::max_record_size(self.shared.conf.needle_max_size);
        let mut file = self.shared.file.lock();
        let len = file.f.metadata()?.len();
        let mut pos = 0u64;
        let mut buf = [0u8; RECORD_SIZE];
        while pos + RECORD_SIZE as u64 <= len {
            file.f.read_exact_at(&mut buf, pos)?;
            let entry = match IndexEntry::parse(&buf, max_size) {
                Ok(e) => e,
                Err(e) => {
                    warn!(
                        "Index {:?} has invalid record at byte {}: {}",
                        self.shared.path, pos, e
                    );
                    break;
                }
            };
            cb(&entry)?;
            pos += RECORD_SIZE as u64;
        }
        if len > pos {
            warn!(
                "Index {:?} has {} trailing bytes after {}, will overwrite",
                self.shared.path,
                len - pos,
                pos
            );
        }
        file.wpos = pos;
        info!("Recovered index {:?}, {} records", self.shared.path, pos / RECORD_SIZE as u64);
        Ok(())
    }

    /// Append an entry directly to the file buffer, bypassing the ring.
    /// Used while rebuilding the index during superblock recovery.
    pub fn write(&self, key: i64, offset: u32, size: i32) -> Result<()> {
        if self.closed {
            return Err(StoreError::IndexClosed);
        }
        self.shared
            .file
            .lock()
            .append(&IndexEntry { key, offset, size })
    }

    /// Write out buffered records and fsync.
    pub fn flush(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::IndexClosed);
        }
        self.shared.file.lock().flush(true)
    }

    /// Drop every record: clear the append buffer, reset the write cursor
    /// and empty the file. Used when the index is found inconsistent with
    /// its superblock and must be rebuilt from scratch.
    pub fn truncate(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::IndexClosed);
        }
        let mut file = self.shared.file.lock();
        file.buf.clear();
        file.wpos = 0;
        file.f.set_len(0)?;
        file.f.sync_data()?;
        warn!("Truncated index {:?}", self.shared.path);
        Ok(())
    }

    /// Spawn the drain thread. No-op if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() || self.closed {
            return Ok(());
        }
        let Some(rx) = self.rx.take() else {
            return Ok(());
        };
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("index-merge".into())
            .spawn(move || drain_loop(&shared, &rx))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Queue an entry for the drain thread, signalling it once enough
    /// entries pile up. Fails with `RingFull` when persistence cannot keep
    /// up with the write rate.
    pub fn add(&self, key: i64, offset: u32, size: i32) -> Result<()> {
        if self.closed {
            return Err(StoreError::IndexClosed);
        }
        let buffered = {
            let mut ring = self.shared.ring.lock();
            ring.push(IndexEntry { key, offset, size })?;
            ring.buffered()
        };
        if buffered >= self.shared.conf.index_merge_write {
            // coalesced wakeup, losing the race is fine
            let _ = self.tx.try_send(Signal::Ready);
        }
        Ok(())
    }

    /// Drain outstanding entries, stop the drain thread, fsync and mark
    /// the index closed. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Signal::Finish);
            if handle.join().is_err() {
                warn!("Index merge thread panicked for {:?}", self.shared.path);
            }
        } else {
            self.shared.file.lock().flush(true)?;
        }
        self.shared.file.lock().f.sync_all()?;
        debug!("Closed index {:?}", self.shared.path);
        Ok(())
    }

    /// Close and remove the backing file.
    pub fn destroy(mut self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.shared.path)?;
        info!("Destroyed index {:?}", self.shared.path);
        Ok(())
    }
}

fn drain_loop(shared: &Shared, rx: &Receiver<Signal>) {
    debug!("Index merge thread started for {:?}", shared.path);
    loop {
        let finish = match rx.recv_timeout(shared.conf.index_merge_delay) {
            Ok(Signal::Ready) | Err(RecvTimeoutError::Timeout) => false,
            Ok(Signal::Finish) | Err(RecvTimeoutError::Disconnected) => true,
        };
        if let Err(e) = merge(shared, finish) {
            warn!("Index merge failed for {:?}: {}", shared.path, e);
            break;
        }
        if finish {
            break;
        }
    }
    debug!("Index merge thread exited for {:?}", shared.path);
}

/// Move everything buffered in the ring into the file.
fn merge(shared: &Shared, force: bool) -> Result<()> {
    let mut file = shared.file.lock();
    loop {
        let entry = shared.ring.lock().pop();
        match entry {
            Some(e) => file.append(&e)?,
            None => break,
        }
    }
    file.flush(force)
}
