use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::{parse_record, ChunkLocation, ChunkSource, GetRecord, HasRecord, TableIndex};
use crate::chunk::Chunk;
use crate::errdata;
use crate::error::{Error, Result};
use crate::hash::Addr;
use crate::stats::Stats;

/// Byte-range access to a table file. Implemented by pread over a cached
/// file handle for local tables and by ranged object fetches for blobstore
/// tables.
pub trait TableData: Send + Sync {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// A [`ChunkSource`] over a parsed index and a byte-range data source.
pub struct TableReader {
    name: Addr,
    index: Arc<TableIndex>,
    data: Box<dyn TableData>,
    stats: Arc<Stats>,
}

/// One request resolved against this table, pending a physical read.
struct Hit {
    req: usize,
    addr: Addr,
    offset: u64,
    length: u32,
}

impl TableReader {
    pub fn new(
        name: Addr,
        index: Arc<TableIndex>,
        data: Box<dyn TableData>,
        stats: Arc<Stats>,
    ) -> TableReader {
        TableReader {
            name,
            index,
            data,
            stats,
        }
    }

    fn read_entry(&self, addr: &Addr, offset: u64, length: u32) -> Result<Vec<u8>> {
        let buf = self.data.read_at(offset, length as usize)?;
        self.stats.record_physical_read(buf.len() as u64);
        parse_record(&buf, addr)
    }

    /// Resolves still-unfound requests against the index, in offset order.
    fn find_hits(&self, reqs: &[GetRecord]) -> Vec<Hit> {
        let mut hits = Vec::new();
        for (i, req) in reqs.iter().enumerate() {
            if req.found {
                continue;
            }
            if let Some(entry) = self.index.lookup(&req.addr) {
                hits.push(Hit {
                    req: i,
                    addr: req.addr,
                    offset: entry.offset,
                    length: entry.length,
                });
            }
        }
        hits.sort_unstable_by_key(|h| h.offset);
        hits
    }
}

impl ChunkSource for TableReader {
    fn name(&self) -> Addr {
        self.name
    }

    fn count(&self) -> u32 {
        self.index.chunk_count()
    }

    fn uncompressed_len(&self) -> u64 {
        self.index.uncompressed_len()
    }

    fn physical_len(&self) -> u64 {
        self.index.physical_len()
    }

    fn has(&self, addr: &Addr) -> Result<bool> {
        Ok(self.index.lookup_ordinal(addr).is_some())
    }

    fn has_many(&self, reqs: &mut [HasRecord]) -> Result<bool> {
        let mut remaining = false;
        for req in reqs.iter_mut() {
            if !req.has {
                req.has = self.index.lookup_ordinal(&req.addr).is_some();
            }
            remaining |= !req.has;
        }
        Ok(remaining)
    }

    fn get(&self, addr: &Addr) -> Result<Option<Vec<u8>>> {
        match self.index.lookup(addr) {
            Some(entry) => Ok(Some(self.read_entry(addr, entry.offset, entry.length)?)),
            None => Ok(None),
        }
    }

    fn get_many(&self, reqs: &mut [GetRecord], sink: &Sender<Chunk>) -> Result<bool> {
        let hits = self.find_hits(reqs);

        // Coalesce contiguous records into one physical read apiece.
        let mut i = 0;
        while i < hits.len() {
            let start = hits[i].offset;
            let mut end = start + hits[i].length as u64;
            let mut j = i + 1;
            while j < hits.len() && hits[j].offset <= end {
                end = end.max(hits[j].offset + hits[j].length as u64);
                j += 1;
            }

            let buf = self.data.read_at(start, (end - start) as usize)?;
            self.stats.record_physical_read(buf.len() as u64);
            for hit in &hits[i..j] {
                let lo = (hit.offset - start) as usize;
                let hi = lo + hit.length as usize;
                let data = parse_record(&buf[lo..hi], &hit.addr)?;
                sink.send(Chunk::with_addr(hit.addr, data))
                    .map_err(|_| Error::IO("chunk sink closed".to_string()))?;
                reqs[hit.req].found = true;
            }
            i = j;
        }

        Ok(reqs.iter().any(|r| !r.found))
    }

    fn calc_reads(&self, reqs: &mut [GetRecord], block_size: u64) -> Result<(usize, bool, bool)> {
        let hits = self.find_hits(reqs);

        let mut reads = 0;
        let mut split = false;
        let mut i = 0;
        while i < hits.len() {
            let start = hits[i].offset;
            let mut end = start + hits[i].length as u64;
            let mut j = i + 1;
            // A trailing gap smaller than one block is cheaper to read
            // through than to split into a second request.
            while j < hits.len() && hits[j].offset <= end + block_size {
                end = end.max(hits[j].offset + hits[j].length as u64);
                j += 1;
            }
            reads += 1;
            split |= end - start > block_size;
            for hit in &hits[i..j] {
                reqs[hit.req].found = true;
            }
            i = j;
        }

        let remaining = reqs.iter().any(|r| !r.found);
        Ok((reads, split, remaining))
    }

    fn chunk_ranges(&self, addrs: &mut Vec<Addr>) -> Result<HashMap<Addr, ChunkLocation>> {
        let mut found = HashMap::new();
        addrs.retain(|addr| match self.index.lookup(addr) {
            Some(entry) => {
                found.insert(*addr, entry.location());
                false
            }
            None => true,
        });
        Ok(found)
    }

    fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let addrs = self.index.ordinal_addrs();
        let mut out = Vec::with_capacity(addrs.len());
        for (ordinal, addr) in addrs.into_iter().enumerate() {
            let entry = self.index.entry(ordinal as u32);
            let data = self.read_entry(&addr, entry.offset, entry.length)?;
            out.push(Chunk::with_addr(addr, data));
        }
        Ok(out)
    }
}

/// Table data held entirely in memory. Backs tests and any caller that
/// already has a whole table file in a buffer.
pub struct BytesTableData(pub Vec<u8>);

impl TableData for BytesTableData {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let lo = offset as usize;
        let hi = lo + len;
        if hi > self.0.len() {
            return errdata!(
                "table read past end: {hi} > {len} bytes",
                len = self.0.len()
            );
        }
        Ok(self.0[lo..hi].to_vec())
    }
}
