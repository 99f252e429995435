//! Append-only superblock container file.
//!
//! A superblock starts with an 8-byte header (magic + version + reserved)
//! followed by back-to-back needle records. Appends go through a buffered
//! write handle; point reads and delete-flag flips go through a separate
//! read handle with positioned I/O, so they never disturb the append
//! cursor.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::needle::{self, Flag, Needle};
use crate::types::StoreConfig;

/// Marks a superblock file.
pub const MAGIC: [u8; 4] = [0xAB, 0xCD, 0xEF, 0x00];
/// Current on-disk format version.
pub const VER: u8 = 1;

/// Header size, one alignment unit: magic + version + 3 reserved bytes.
const HEADER_SIZE: usize = needle::PADDING as usize;
const MAX_OFFSET: u32 = u32::MAX;

/// Append-only needle container.
pub struct SuperBlock {
    path: PathBuf,
    /// Buffered append handle.
    w: BufWriter<File>,
    /// Positioned read handle, also used for flag flips and repair.
    r: File,
    conf: Arc<StoreConfig>,
    /// Next append position in 8-byte units.
    offset: u32,
    /// Logical file size in bytes, header included.
    size: u64,
    ver: u8,
    flush_count: usize,
    closed: bool,
}

impl SuperBlock {
    /// Open a superblock file, creating and initializing it if absent.
    pub fn open<P: AsRef<Path>>(path: P, conf: Arc<StoreConfig>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let wf = OpenOptions::new().write(true).create(true).open(&path)?;
        let rf = File::open(&path)?;
        let len = rf.metadata()?.len();
        let mut sb = Self {
            path,
            w: BufWriter::with_capacity(conf.block_buffer_size, wf),
            r: rf,
            conf,
            offset: needle::needle_offset(HEADER_SIZE as u64),
            size: 0,
            ver: VER,
            flush_count: 0,
            closed: false,
        };
        if len == 0 {
            sb.init()?;
        } else {
            sb.parse_header()?;
            sb.w.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
            sb.size = len;
        }
        debug!("Opened superblock {:?}, size {}", sb.path, sb.size);
        Ok(sb)
    }

    fn init(&mut self) -> Result<()> {
        if self.conf.preallocate > 0 {
            self.w.get_ref().set_len(self.conf.preallocate)?;
        }
        self.w.write_all(&MAGIC)?;
        self.w.write_all(&[VER, 0, 0, 0])?;
        self.w.flush()?;
        self.size = HEADER_SIZE as u64;
        Ok(())
    }

    fn parse_header(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        self.r.read_exact_at(&mut buf, 0)?;
        if buf[..4] != MAGIC {
            return Err(StoreError::SuperBlockMagic);
        }
        if buf[4] != VER {
            return Err(StoreError::SuperBlockVersion(buf[4]));
        }
        self.ver = buf[4];
        Ok(())
    }

    /// Next append position in 8-byte units.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_available(&self, incr: u32) -> Result<()> {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        if MAX_OFFSET - incr < self.offset {
            return Err(StoreError::SuperBlockNoSpace);
        }
        Ok(())
    }

    /// Append one needle and flush, returning its offset.
    pub fn add(&mut self, n: &Needle) -> Result<u32> {
        let offset = self.write(n)?;
        self.flush()?;
        Ok(offset)
    }

    /// Append one needle without flushing. Callers batching several records
    /// must call [`flush`](Self::flush) before releasing them to readers.
    pub fn write(&mut self, n: &Needle) -> Result<u32> {
        let incr = n.incr_offset();
        self.check_available(incr)?;
        n.write_to(&mut self.w)?;
        let offset = self.offset;
        self.offset += incr;
        self.size += n.total_size as u64;
        Ok(offset)
    }

    /// Push buffered bytes to the OS; fsync every Nth flush.
    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        self.w.flush()?;
        self.flush_count += 1;
        if self.flush_count >= self.conf.block_sync_write {
            self.flush_count = 0;
            self.w.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes of the record at `offset`.
    pub fn get(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        self.r.read_exact_at(buf, needle::block_offset(offset))?;
        Ok(())
    }

    /// Flip the record at `offset` to deleted in place.
    pub fn del(&self, offset: u32) -> Result<()> {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        self.w.get_ref().write_all_at(
            &[Flag::Deleted as u8],
            needle::block_offset(offset) + needle::FLAG_OFFSET,
        )?;
        Ok(())
    }

    /// Clone a standalone delete handle that stays usable while the
    /// superblock itself is locked elsewhere.
    pub fn deleter(&self) -> Result<BlockDeleter> {
        Ok(BlockDeleter {
            f: self.w.get_ref().try_clone()?,
        })
    }

    /// Overwrite the record at `offset` with a healthy replacement. The
    /// replacement must parse and match the on-disk record size.
    pub fn repair(&self, offset: u32, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        Needle::parse_bytes(buf)?;
        let mut hdr = [0u8; needle::HEADER_SIZE];
        self.r.read_exact_at(&mut hdr, needle::block_offset(offset))?;
        let mut szb = [0u8; 4];
        szb.copy_from_slice(&hdr[needle::HEADER_SIZE - 4..]);
        let expected = needle::record_size(i32::from_be_bytes(szb) as usize) as usize;
        if expected != buf.len() {
            return Err(StoreError::RepairSize {
                expected,
                actual: buf.len(),
            });
        }
        self.w
            .get_ref()
            .write_all_at(buf, needle::block_offset(offset))?;
        warn!("Repaired needle at offset {} in {:?}", offset, self.path);
        Ok(())
    }

    /// Walk records sequentially through `file` starting at `offset`
    /// (8-byte units; 0 means the first record). The callback receives each
    /// needle with its start and end offsets. Returns the offset one past
    /// the last complete record; a partial trailing record counts as a
    /// clean end.
    pub(crate) fn scan_file<F>(file: &File, start: u32, mut cb: F) -> Result<u32>
    where
        F: FnMut(Needle, u32, u32) -> Result<()>,
    {
        let start = if start == 0 {
            needle_start()
        } else {
            start
        };
        let mut f = file;
        f.seek(SeekFrom::Start(needle::block_offset(start)))?;
        let mut rd = BufReader::new(f);
        let mut so = start;
        let mut eo = start;
        loop {
            match Needle::parse_from(&mut rd) {
                Ok(n) => {
                    eo += n.incr_offset();
                    cb(n, so, eo)?;
                    so = eo;
                }
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(eo)
    }

    /// Scan this superblock's records from `start` via the read handle.
    pub fn scan<F>(&self, start: u32, cb: F) -> Result<u32>
    where
        F: FnMut(Needle, u32, u32) -> Result<()>,
    {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        Self::scan_file(&self.r, start, cb)
    }

    /// Scan from `start` through a private file handle, so concurrent
    /// appends and reads through the regular handles are unaffected.
    pub fn compact<F>(&self, start: u32, cb: F) -> Result<u32>
    where
        F: FnMut(Needle, u32, u32) -> Result<()>,
    {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        let f = File::open(&self.path)?;
        Self::scan_file(&f, start, cb)
    }

    /// Rebuild the append cursor by scanning from `start`, reporting each
    /// complete record to `cb`. The first unparsable record ends the valid
    /// region; anything after it is truncated away.
    pub fn recovery<F>(&mut self, start: u32, mut cb: F) -> Result<()>
    where
        F: FnMut(&Needle, u32, u32) -> Result<()>,
    {
        if self.closed {
            return Err(StoreError::SuperBlockClosed);
        }
        let start = if start == 0 { needle_start() } else { start };
        let mut end = start;
        let res = Self::scan_file(&self.r, start, |n, so, eo| {
            cb(&n, so, eo)?;
            end = eo;
            Ok(())
        });
        match res {
            Ok(_) => {}
            Err(e) if e.is_format() => {
                warn!(
                    "Superblock {:?} has corrupt data after offset {}: {}",
                    self.path, end, e
                );
            }
            Err(e) => return Err(e),
        }
        self.offset = end;
        let valid = needle::block_offset(end);
        self.w.seek(SeekFrom::Start(valid))?;
        let len = self.r.metadata()?.len();
        if len > valid {
            warn!(
                "Truncating superblock {:?} from {} to {} bytes",
                self.path, len, valid
            );
            self.w.get_ref().set_len(valid)?;
        }
        self.size = valid;
        info!(
            "Recovered superblock {:?}, offset {}, size {}",
            self.path, self.offset, self.size
        );
        Ok(())
    }

    /// Flush, fsync and mark the superblock closed. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.w.flush()?;
        self.w.get_ref().sync_all()?;
        self.closed = true;
        debug!("Closed superblock {:?}", self.path);
        Ok(())
    }

    /// Close and remove the backing file.
    pub fn destroy(mut self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(&self.path)?;
        info!("Destroyed superblock {:?}", self.path);
        Ok(())
    }
}

/// Offset of the first record, right after the superblock header.
fn needle_start() -> u32 {
    needle::needle_offset(HEADER_SIZE as u64)
}

/// Standalone handle that flips delete flags without touching the
/// superblock's locks or append cursor.
pub struct BlockDeleter {
    f: File,
}

impl BlockDeleter {
    /// Flip the record at `offset` to deleted in place.
    pub fn del(&self, offset: u32) -> Result<()> {
        self.f.write_all_at(
            &[Flag::Deleted as u8],
            needle::block_offset(offset) + needle::FLAG_OFFSET,
        )?;
        Ok(())
    }
}
