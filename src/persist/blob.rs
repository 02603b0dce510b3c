use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{filter_novel, plan_conjoin, ChunkHaver, Semaphore, TablePersister};
use crate::errdata;
use crate::error::{Error, Result};
use crate::hash::Addr;
use crate::memtable::MemTable;
use crate::runtime::IndexCache;
use crate::stats::Stats;
use crate::table::{index_region_len, write_table, ChunkSource, TableData, TableIndex, TableReader, FOOTER_LEN};

/// Concurrent reads allowed against one blobstore.
pub const DEFAULT_READ_LIMIT: usize = 32;

/// A byte range of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRange {
    All,
    /// The trailing `n` bytes.
    Suffix(u64),
    Range {
        offset: u64,
        len: u64,
    },
}

/// A fetched object (or range of one) and the generation it was read at.
#[derive(Debug, Clone)]
pub struct BlobGet {
    pub data: Vec<u8>,
    pub generation: u64,
}

/// Outcome of a conditional put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAndPut {
    /// The object was written; this is its new generation.
    Written(u64),
    /// The object's generation no longer matched; nothing was written.
    Conflict,
}

/// Generation-versioned object storage: the seam behind which a bucket
/// store (GCS, S3) plugs in. Objects written under content-addressed keys
/// are immutable, so ranged reads never need generation pinning; the
/// mutable manifest object relies on `check_and_put` generation matching
/// for its compare-and-set.
pub trait Blobstore: Send + Sync {
    fn get(&self, key: &str, range: BlobRange) -> Result<Option<BlobGet>>;

    /// Unconditionally writes the object, returning its new generation.
    fn put(&self, key: &str, data: &[u8]) -> Result<u64>;

    /// Writes the object only if its current generation matches
    /// `expected_generation` (`None` meaning the object must not exist).
    fn check_and_put(
        &self,
        expected_generation: Option<u64>,
        key: &str,
        data: &[u8],
    ) -> Result<CheckAndPut>;
}

/// An in-process [`Blobstore`], used in tests and as the reference for the
/// trait's semantics.
#[derive(Default)]
pub struct MemoryBlobstore {
    objects: Mutex<HashMap<String, (Arc<Vec<u8>>, u64)>>,
}

impl MemoryBlobstore {
    pub fn new() -> MemoryBlobstore {
        MemoryBlobstore::default()
    }
}

impl Blobstore for MemoryBlobstore {
    fn get(&self, key: &str, range: BlobRange) -> Result<Option<BlobGet>> {
        let objects = self.objects.lock()?;
        let Some((data, generation)) = objects.get(key) else {
            return Ok(None);
        };
        let len = data.len() as u64;
        let (lo, hi) = match range {
            BlobRange::All => (0, len),
            BlobRange::Suffix(n) => (len.saturating_sub(n), len),
            BlobRange::Range { offset, len: n } => (offset, offset + n),
        };
        if hi > len || lo > hi {
            return errdata!("blob range {lo}..{hi} out of bounds for {key} ({len} bytes)");
        }
        Ok(Some(BlobGet {
            data: data[lo as usize..hi as usize].to_vec(),
            generation: *generation,
        }))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        let mut objects = self.objects.lock()?;
        let generation = objects.get(key).map(|(_, g)| g + 1).unwrap_or(1);
        objects.insert(key.to_string(), (Arc::new(data.to_vec()), generation));
        Ok(generation)
    }

    fn check_and_put(
        &self,
        expected_generation: Option<u64>,
        key: &str,
        data: &[u8],
    ) -> Result<CheckAndPut> {
        let mut objects = self.objects.lock()?;
        let current = objects.get(key).map(|(_, g)| *g);
        if current != expected_generation {
            return Ok(CheckAndPut::Conflict);
        }
        let generation = current.unwrap_or(0) + 1;
        objects.insert(key.to_string(), (Arc::new(data.to_vec()), generation));
        Ok(CheckAndPut::Written(generation))
    }
}

/// Persists tables as blobstore objects keyed by the base32 form of their
/// address. Indices are fetched lazily on first open (footer, then index
/// region); chunk data is served by ranged reads bounded by the read-limit
/// semaphore.
pub struct BlobstorePersister {
    bs: Arc<dyn Blobstore>,
    index_cache: Arc<IndexCache>,
    read_limit: Arc<Semaphore>,
}

impl BlobstorePersister {
    pub fn new(bs: Arc<dyn Blobstore>, index_cache: Arc<IndexCache>) -> BlobstorePersister {
        Self::with_read_limit(bs, index_cache, DEFAULT_READ_LIMIT)
    }

    pub fn with_read_limit(
        bs: Arc<dyn Blobstore>,
        index_cache: Arc<IndexCache>,
        read_limit: usize,
    ) -> BlobstorePersister {
        BlobstorePersister {
            bs,
            index_cache,
            read_limit: Arc::new(Semaphore::new(read_limit)),
        }
    }

    fn load_index(&self, name: &Addr, chunk_count: u32) -> Result<Arc<TableIndex>> {
        if let Some(index) = self.index_cache.get(name) {
            return Ok(index);
        }

        let key = name.to_string();
        let footer = self
            .bs
            .get(&key, BlobRange::Suffix(FOOTER_LEN as u64))?
            .ok_or_else(|| Error::Fetch(format!("table {name} not in blobstore")))?;
        let (count, _) = TableIndex::parse_footer(&footer.data)?;
        if count != chunk_count {
            return errdata!("table {name} holds {count} chunks, manifest says {chunk_count}");
        }

        let tail = self
            .bs
            .get(&key, BlobRange::Suffix(index_region_len(count)))?
            .ok_or_else(|| Error::Fetch(format!("table {name} not in blobstore")))?;
        let index = Arc::new(TableIndex::parse(&tail.data)?);
        self.index_cache.insert(*name, index.clone());
        Ok(index)
    }
}

impl TablePersister for BlobstorePersister {
    fn persist(
        &self,
        mt: &MemTable,
        haves: &dyn ChunkHaver,
        stats: &Arc<Stats>,
    ) -> Result<Option<Arc<dyn ChunkSource>>> {
        let novel = filter_novel(mt, haves)?;
        if novel.is_empty() {
            return Ok(None);
        }
        let (name, bytes, count) = write_table(novel);
        self.bs.put(&name.to_string(), &bytes)?;
        stats.record_table_persisted(bytes.len() as u64);
        tracing::debug!(table = %name, chunks = count, bytes = bytes.len(), "persisted table to blobstore");
        self.open(name, count, stats).map(Some)
    }

    fn conjoin_all(
        &self,
        sources: &[Arc<dyn ChunkSource>],
        stats: &Arc<Stats>,
    ) -> Result<Arc<dyn ChunkSource>> {
        let (name, bytes, count) = plan_conjoin(sources)?;
        self.bs.put(&name.to_string(), &bytes)?;
        stats.record_table_persisted(bytes.len() as u64);
        tracing::debug!(table = %name, inputs = sources.len(), chunks = count, "conjoined tables in blobstore");
        self.open(name, count, stats)
    }

    fn open(
        &self,
        name: Addr,
        chunk_count: u32,
        stats: &Arc<Stats>,
    ) -> Result<Arc<dyn ChunkSource>> {
        let index = self.load_index(&name, chunk_count)?;
        let data = BlobTableData {
            bs: self.bs.clone(),
            key: name.to_string(),
            limit: self.read_limit.clone(),
        };
        Ok(Arc::new(TableReader::new(
            name,
            index,
            Box::new(data),
            stats.clone(),
        )))
    }
}

/// Ranged data reads against a table object, gated by the persister's
/// read-limit semaphore.
struct BlobTableData {
    bs: Arc<dyn Blobstore>,
    key: String,
    limit: Arc<Semaphore>,
}

impl TableData for BlobTableData {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _permit = self.limit.acquire();
        let got = self
            .bs
            .get(
                &self.key,
                BlobRange::Range {
                    offset,
                    len: len as u64,
                },
            )?
            .ok_or_else(|| Error::Fetch(format!("table {} not in blobstore", self.key)))?;
        if got.data.len() != len {
            return errdata!(
                "short blob read of {}: wanted {len} bytes, got {}",
                self.key,
                got.data.len()
            );
        }
        Ok(got.data)
    }
}

#[cfg(test)]
mod tests {
    use super::super::NoHaves;
    use super::*;
    use crate::chunk::Chunk;

    #[test]
    fn test_memory_blobstore_ranges() -> Result<()> {
        let bs = MemoryBlobstore::new();
        bs.put("k", b"0123456789")?;

        assert_eq!(bs.get("k", BlobRange::All)?.unwrap().data, b"0123456789");
        assert_eq!(bs.get("k", BlobRange::Suffix(3))?.unwrap().data, b"789");
        assert_eq!(
            bs.get("k", BlobRange::Range { offset: 2, len: 4 })?.unwrap().data,
            b"2345"
        );
        assert_eq!(bs.get("k", BlobRange::Suffix(99))?.unwrap().data, b"0123456789");
        assert!(bs.get("k", BlobRange::Range { offset: 8, len: 4 }).is_err());
        assert!(bs.get("missing", BlobRange::All)?.is_none());
        Ok(())
    }

    #[test]
    fn test_memory_blobstore_generations() -> Result<()> {
        let bs = MemoryBlobstore::new();

        assert_eq!(bs.check_and_put(None, "k", b"v1")?, CheckAndPut::Written(1));
        assert_eq!(bs.check_and_put(None, "k", b"v2")?, CheckAndPut::Conflict);
        assert_eq!(bs.check_and_put(Some(1), "k", b"v2")?, CheckAndPut::Written(2));
        assert_eq!(bs.check_and_put(Some(1), "k", b"v3")?, CheckAndPut::Conflict);
        assert_eq!(bs.get("k", BlobRange::All)?.unwrap().data, b"v2");

        assert_eq!(bs.put("k", b"v4")?, 3);
        Ok(())
    }

    #[test]
    fn test_blob_persist_and_reopen() -> Result<()> {
        let bs: Arc<dyn Blobstore> = Arc::new(MemoryBlobstore::new());
        let stats = Arc::new(Stats::new());
        let p = BlobstorePersister::new(bs.clone(), Arc::new(IndexCache::new(1 << 20)));

        let mut mt = MemTable::new(1 << 20);
        let chunks: Vec<Chunk> = (0..8)
            .map(|i| Chunk::new(format!("blob chunk {i}").into_bytes()))
            .collect();
        for c in &chunks {
            assert!(mt.add_chunk(*c.addr(), c.data().to_vec()));
        }

        let source = p.persist(&mt, &NoHaves, &stats)?.expect("table expected");
        assert_eq!(source.count(), 8);

        // A second persister with a cold index cache fetches the footer and
        // index lazily.
        let p2 = BlobstorePersister::new(bs, Arc::new(IndexCache::new(1 << 20)));
        let reopened = p2.open(source.name(), 8, &stats)?;
        for c in &chunks {
            assert_eq!(reopened.get(c.addr())?.as_deref(), Some(c.data()));
        }
        Ok(())
    }

    #[test]
    fn test_blob_open_missing_table_is_fetch_error() {
        let bs: Arc<dyn Blobstore> = Arc::new(MemoryBlobstore::new());
        let stats = Arc::new(Stats::new());
        let p = BlobstorePersister::new(bs, Arc::new(IndexCache::new(1 << 20)));

        let err = p.open(Addr::of(b"nowhere"), 1, &stats).unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }
}
