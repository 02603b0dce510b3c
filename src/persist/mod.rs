//! Table persisters: strategies for writing sealed memtables out as table
//! files and reading them back, over local disk or a blobstore.

pub mod blob;
pub mod fs;

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use itertools::Itertools;

use crate::chunk::Chunk;
use crate::error::Result;
use crate::hash::Addr;
use crate::memtable::MemTable;
use crate::stats::Stats;
use crate::table::{to_has_records, write_table, ChunkSource, HasRecord};

pub use blob::{BlobRange, Blobstore, BlobstorePersister, CheckAndPut, MemoryBlobstore};
pub use fs::FsTablePersister;

/// Presence checks against already-held chunks, used to deduplicate a
/// memtable against the rest of a table set before serializing it.
pub trait ChunkHaver {
    fn has_many(&self, reqs: &mut [HasRecord]) -> Result<bool>;
}

impl ChunkHaver for Vec<Arc<dyn ChunkSource>> {
    fn has_many(&self, reqs: &mut [HasRecord]) -> Result<bool> {
        let mut remaining = true;
        for source in self {
            if !remaining {
                break;
            }
            remaining = source.has_many(reqs)?;
        }
        Ok(remaining)
    }
}

/// A haver holding nothing; every chunk is novel against it.
pub struct NoHaves;

impl ChunkHaver for NoHaves {
    fn has_many(&self, _reqs: &mut [HasRecord]) -> Result<bool> {
        Ok(true)
    }
}

/// Writes memtables out as table files and opens existing tables by name.
///
/// `stats` is threaded by `Arc` so readers opened here can keep recording
/// physical reads for the owning store after the call returns.
pub trait TablePersister: Send + Sync {
    /// Serializes the memtable's chunks, minus any already present in
    /// `haves`, into a new table file. Returns `None` when every chunk was
    /// a duplicate and no table was written.
    fn persist(
        &self,
        mt: &MemTable,
        haves: &dyn ChunkHaver,
        stats: &Arc<Stats>,
    ) -> Result<Option<Arc<dyn ChunkSource>>>;

    /// Merges several tables into one. The merged table holds the union of
    /// the inputs' chunks (first source wins on duplicates), sorted by
    /// address.
    fn conjoin_all(
        &self,
        sources: &[Arc<dyn ChunkSource>],
        stats: &Arc<Stats>,
    ) -> Result<Arc<dyn ChunkSource>>;

    /// Opens an existing table by name. `chunk_count` is the count recorded
    /// in the manifest and must match the table's own footer.
    fn open(&self, name: Addr, chunk_count: u32, stats: &Arc<Stats>)
        -> Result<Arc<dyn ChunkSource>>;
}

/// Returns the memtable's chunks that `haves` does not already hold, in
/// insertion order.
pub(crate) fn filter_novel<'a>(
    mt: &'a MemTable,
    haves: &dyn ChunkHaver,
) -> Result<Vec<(&'a Addr, &'a [u8])>> {
    let addrs: Vec<Addr> = mt.iter().map(|(addr, _)| *addr).collect();
    let mut reqs = to_has_records(&addrs);
    haves.has_many(&mut reqs)?;
    let have: HashSet<Addr> = reqs.iter().filter(|r| r.has).map(|r| r.addr).collect();
    Ok(mt.iter().filter(|&(addr, _)| !have.contains(addr)).collect())
}

/// Builds the merged table file for a conjoin: union of the sources'
/// chunks, earlier sources winning duplicates, output sorted by address.
pub(crate) fn plan_conjoin(sources: &[Arc<dyn ChunkSource>]) -> Result<(Addr, Vec<u8>, u32)> {
    let mut all: Vec<Chunk> = Vec::new();
    for source in sources {
        all.extend(source.all_chunks()?);
    }
    let mut merged: Vec<Chunk> = all.into_iter().unique_by(|c| *c.addr()).collect();
    merged.sort_unstable_by(|a, b| a.addr().cmp(b.addr()));

    let (name, bytes, count) = write_table(merged.iter().map(|c| (c.addr(), c.data())));
    Ok((name, bytes, count))
}

/// A counting semaphore bounding concurrent reads against rate-limited
/// backends.
pub struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.released.wait(permits).unwrap();
        }
        *permits -= 1;
        SemaphoreGuard { semaphore: self }
    }
}

pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut permits = self.semaphore.permits.lock().unwrap();
        *permits += 1;
        self.semaphore.released.notify_one();
    }
}
