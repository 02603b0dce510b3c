use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::Mmap;

use super::{filter_novel, plan_conjoin, ChunkHaver, TablePersister};
use crate::errdata;
use crate::error::Result;
use crate::hash::Addr;
use crate::memtable::MemTable;
use crate::runtime::{FdCache, IndexCache};
use crate::stats::Stats;
use crate::table::{
    index_region_len, write_table, ChunkSource, TableData, TableIndex, TableReader, FOOTER_LEN,
};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Persists tables as files in the store directory, each named by the
/// base32 form of its address. New tables are written to a temp file and
/// renamed into place, so a table file either exists in full or not at all.
pub struct FsTablePersister {
    dir: PathBuf,
    fd_cache: Arc<FdCache>,
    index_cache: Arc<IndexCache>,
}

impl FsTablePersister {
    pub fn new(
        dir: impl Into<PathBuf>,
        fd_cache: Arc<FdCache>,
        index_cache: Arc<IndexCache>,
    ) -> FsTablePersister {
        FsTablePersister {
            dir: dir.into(),
            fd_cache,
            index_cache,
        }
    }

    fn table_path(&self, name: &Addr) -> PathBuf {
        self.dir.join(name.to_string())
    }

    fn write_table_file(&self, name: &Addr, bytes: &[u8]) -> Result<()> {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = self.dir.join(format!(".table-{}-{n}", std::process::id()));
        let mut temp = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        temp.write_all(bytes)?;
        temp.sync_all()?;
        drop(temp);
        fs::rename(&temp_path, self.table_path(name))?;
        Ok(())
    }

    /// Loads the table's parsed index, from the cache if it is resident.
    /// On a miss the file is mapped just long enough to parse the tail.
    fn load_index(&self, name: &Addr, chunk_count: u32) -> Result<Arc<TableIndex>> {
        if let Some(index) = self.index_cache.get(name) {
            return Ok(index);
        }

        let path = self.table_path(name);
        let file = self.fd_cache.open(&path)?;
        let mmap = unsafe { Mmap::map(file.as_ref()) }?;
        let index = Arc::new(parse_index(name, &mmap, chunk_count)?);
        self.index_cache.insert(*name, index.clone());
        Ok(index)
    }
}

fn parse_index(name: &Addr, file_bytes: &[u8], expected_count: u32) -> Result<TableIndex> {
    if file_bytes.len() < FOOTER_LEN {
        return errdata!("table {name} too short: {} bytes", file_bytes.len());
    }
    let (count, _) = TableIndex::parse_footer(&file_bytes[file_bytes.len() - FOOTER_LEN..])?;
    if count != expected_count {
        return errdata!("table {name} holds {count} chunks, manifest says {expected_count}");
    }
    let region = index_region_len(count) as usize;
    if file_bytes.len() < region {
        return errdata!("table {name} too short for its own index");
    }
    TableIndex::parse(&file_bytes[file_bytes.len() - region..])
}

impl TablePersister for FsTablePersister {
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
        self.write_table_file(&name, &bytes)?;
        stats.record_table_persisted(bytes.len() as u64);
        tracing::debug!(table = %name, chunks = count, bytes = bytes.len(), "persisted table");
        self.open(name, count, stats).map(Some)
    }

    fn conjoin_all(
        &self,
        sources: &[Arc<dyn ChunkSource>],
        stats: &Arc<Stats>,
    ) -> Result<Arc<dyn ChunkSource>> {
        let (name, bytes, count) = plan_conjoin(sources)?;
        self.write_table_file(&name, &bytes)?;
        stats.record_table_persisted(bytes.len() as u64);
        tracing::debug!(table = %name, inputs = sources.len(), chunks = count, "conjoined tables");
        self.open(name, count, stats)
    }

    fn open(
        &self,
        name: Addr,
        chunk_count: u32,
        stats: &Arc<Stats>,
    ) -> Result<Arc<dyn ChunkSource>> {
        let index = self.load_index(&name, chunk_count)?;
        let data = FsTableData {
            path: self.table_path(&name),
            fds: self.fd_cache.clone(),
        };
        Ok(Arc::new(TableReader::new(
            name,
            index,
            Box::new(data),
            stats.clone(),
        )))
    }
}

/// Data reads against a local table file. Each read pins the cached file
/// handle for its duration, so FD cache eviction cannot close a handle
/// with a pread outstanding.
struct FsTableData {
    path: PathBuf,
    fds: Arc<FdCache>,
}

impl TableData for FsTableData {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;

        let file = self.fds.open(&self.path)?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};

        let file = self.fds.open(&self.path)?;
        let mut file = file.as_ref();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
