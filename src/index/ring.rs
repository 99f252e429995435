//! Fixed-capacity ring buffer for pending index entries.

use crate::error::{Result, StoreError};
use crate::index::IndexEntry;

/// Single-producer single-consumer ring. Read and write counters grow
/// monotonically; their difference is the buffered entry count.
pub(crate) struct Ring {
    data: Box<[IndexEntry]>,
    rn: u64,
    rp: usize,
    wn: u64,
    wp: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![IndexEntry::default(); capacity].into_boxed_slice(),
            rn: 0,
            rp: 0,
            wn: 0,
            wp: 0,
        }
    }

    /// Buffer one entry, failing when the ring is full.
    pub fn push(&mut self, entry: IndexEntry) -> Result<()> {
        if self.buffered() >= self.data.len() {
            return Err(StoreError::RingFull);
        }
        self.data[self.wp] = entry;
        self.wp += 1;
        if self.wp >= self.data.len() {
            self.wp = 0;
        }
        self.wn += 1;
        Ok(())
    }

    /// Take the oldest buffered entry.
    pub fn pop(&mut self) -> Option<IndexEntry> {
        if self.rn == self.wn {
            return None;
        }
        let entry = self.data[self.rp];
        self.rp += 1;
        if self.rp >= self.data.len() {
            self.rp = 0;
        }
        self.rn += 1;
        Some(entry)
    }

    pub fn buffered(&self) -> usize {
        (self.wn - self.rn) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: i64) -> IndexEntry {
        IndexEntry {
            key,
            offset: key as u32,
            size: 40,
        }
    }

    #[test]
    fn push_pop_preserves_order() {
        let mut ring = Ring::new(4);
        for k in 1..=3 {
            ring.push(entry(k)).unwrap();
        }
        assert_eq!(ring.buffered(), 3);
        for k in 1..=3 {
            assert_eq!(ring.pop().unwrap().key, k);
        }
        assert!(ring.pop().is_none());
        assert_eq!(ring.buffered(), 0);
    }

    #[test]
    fn full_ring_rejects_push() {
        let mut ring = Ring::new(2);
        ring.push(entry(1)).unwrap();
        ring.push(entry(2)).unwrap();
        assert!(matches!(ring.push(entry(3)), Err(StoreError::RingFull)));
        ring.pop().unwrap();
        ring.push(entry(3)).unwrap();
    }

    #[test]
    fn wraps_around_capacity() {
        let mut ring = Ring::new(2);
        for k in 1..=10 {
            ring.push(entry(k)).unwrap();
            assert_eq!(ring.pop().unwrap().key, k);
        }
    }
}
