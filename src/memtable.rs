use std::collections::HashMap;
use std::sync::mpsc::Sender;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::hash::Addr;
use crate::table::{GetRecord, HasRecord};

/// A bounded in-RAM write buffer. Chunks accumulate here until the byte
/// budget fills, then the whole memtable is sealed and prepended to the
/// table set as a novel table awaiting persistence.
///
/// Insertion order is preserved; it becomes the data-region order of the
/// table file the memtable is eventually serialized into.
#[derive(Debug)]
pub struct MemTable {
    chunks: HashMap<Addr, Vec<u8>>,
    order: Vec<Addr>,
    data_len: u64,
    budget: u64,
}

impl MemTable {
    pub fn new(budget: u64) -> MemTable {
        MemTable {
            chunks: HashMap::new(),
            order: Vec::new(),
            data_len: 0,
            budget,
        }
    }

    /// Whether a chunk of `len` bytes fits the remaining budget. A chunk
    /// already present always "fits" since adding it again is a no-op.
    pub fn fits(&self, addr: &Addr, len: usize) -> bool {
        self.chunks.contains_key(addr) || self.data_len + len as u64 <= self.budget
    }

    /// Buffers a chunk. Returns false, leaving the memtable unchanged, if
    /// the chunk does not fit; the caller then rotates to a fresh memtable
    /// and retries.
    pub fn add_chunk(&mut self, addr: Addr, data: Vec<u8>) -> bool {
        if self.chunks.contains_key(&addr) {
            return true;
        }
        let len = data.len() as u64;
        if self.data_len + len > self.budget {
            return false;
        }
        self.order.push(addr);
        self.chunks.insert(addr, data);
        self.data_len += len;
        true
    }

    /// Number of distinct chunks buffered.
    pub fn count(&self) -> u32 {
        self.order.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Total buffered chunk data bytes.
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    pub fn has(&self, addr: &Addr) -> bool {
        self.chunks.contains_key(addr)
    }

    pub fn get(&self, addr: &Addr) -> Option<&[u8]> {
        self.chunks.get(addr).map(|d| d.as_slice())
    }

    /// Buffered chunks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Addr, &[u8])> {
        self.order
            .iter()
            .map(move |addr| (addr, self.chunks[addr].as_slice()))
    }

    /// Marks records this memtable holds. Returns whether any record is
    /// still unresolved.
    pub fn has_many(&self, reqs: &mut [HasRecord]) -> bool {
        let mut remaining = false;
        for req in reqs.iter_mut() {
            if !req.has {
                req.has = self.chunks.contains_key(&req.addr);
            }
            remaining |= !req.has;
        }
        remaining
    }

    /// Delivers all still-unfound records this memtable holds through
    /// `sink`, marking them found. Returns whether any record remains
    /// unserved.
    pub fn get_many(&self, reqs: &mut [GetRecord], sink: &Sender<Chunk>) -> Result<bool> {
        let mut remaining = false;
        for req in reqs.iter_mut() {
            if !req.found {
                if let Some(data) = self.chunks.get(&req.addr) {
                    sink.send(Chunk::with_addr(req.addr, data.clone()))
                        .map_err(|_| Error::IO("chunk sink closed".to_string()))?;
                    req.found = true;
                }
            }
            remaining |= !req.found;
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::table::{to_get_records, to_has_records};

    #[test]
    fn test_add_and_get() {
        let mut mt = MemTable::new(1024);
        let c1 = Chunk::new(b"first".to_vec());
        let c2 = Chunk::new(b"second".to_vec());

        assert!(mt.add_chunk(*c1.addr(), c1.data().to_vec()));
        assert!(mt.add_chunk(*c2.addr(), c2.data().to_vec()));

        assert_eq!(mt.count(), 2);
        assert_eq!(mt.data_len(), 11);
        assert!(mt.has(c1.addr()));
        assert_eq!(mt.get(c2.addr()), Some(b"second".as_slice()));
        assert_eq!(mt.get(&Addr::of(b"third")), None);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let mut mt = MemTable::new(1024);
        let c = Chunk::new(b"dup".to_vec());

        assert!(mt.add_chunk(*c.addr(), c.data().to_vec()));
        assert!(mt.add_chunk(*c.addr(), c.data().to_vec()));

        assert_eq!(mt.count(), 1);
        assert_eq!(mt.data_len(), 3);
    }

    #[test]
    fn test_budget_boundary() {
        let mut mt = MemTable::new(10);

        // Exactly at budget fits.
        assert!(mt.add_chunk(Addr::of(b"ten bytes!"), b"ten bytes!".to_vec()));
        assert_eq!(mt.data_len(), 10);

        // One more byte does not.
        assert!(!mt.add_chunk(Addr::of(b"x"), b"x".to_vec()));
        assert_eq!(mt.count(), 1);

        // A zero-length chunk still fits a full memtable.
        assert!(mt.add_chunk(Addr::of(b""), Vec::new()));
        assert_eq!(mt.count(), 2);
    }

    #[test]
    fn test_oversized_chunk_rejected_even_when_empty() {
        let mut mt = MemTable::new(4);
        assert!(!mt.add_chunk(Addr::of(b"too large"), b"too large".to_vec()));
        assert!(mt.is_empty());
    }

    #[test]
    fn test_iter_preserves_insertion_order() {
        let mut mt = MemTable::new(1024);
        let payloads: Vec<Vec<u8>> = (0..5).map(|i| format!("p{i}").into_bytes()).collect();
        for p in &payloads {
            assert!(mt.add_chunk(Addr::of(p), p.clone()));
        }

        let order: Vec<&[u8]> = mt.iter().map(|(_, d)| d).collect();
        let expected: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_get_many_and_has_many() -> Result<()> {
        let mut mt = MemTable::new(1024);
        let c1 = Chunk::new(b"one".to_vec());
        let c2 = Chunk::new(b"two".to_vec());
        mt.add_chunk(*c1.addr(), c1.data().to_vec());

        let addrs = vec![*c1.addr(), *c2.addr()];

        let mut has_reqs = to_has_records(&addrs);
        assert!(mt.has_many(&mut has_reqs));
        assert_eq!(has_reqs.iter().filter(|r| r.has).count(), 1);

        let (tx, rx) = mpsc::channel();
        let mut get_reqs = to_get_records(&addrs);
        assert!(mt.get_many(&mut get_reqs, &tx)?);
        drop(tx);

        let received: Vec<Chunk> = rx.iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].addr(), c1.addr());
        Ok(())
    }
}
