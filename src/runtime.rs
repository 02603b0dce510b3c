use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cache::Cache;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::hash::Addr;
use crate::manifest::{ManifestCache, ManifestLocks};
use crate::table::TableIndex;

/// Shared LRU of parsed table indices, keyed by table name and bounded in
/// bytes. Entries are `Arc`s: eviction drops the cache's reference, and the
/// memory is freed once the last reader drops its clone.
pub struct IndexCache {
    cache: Mutex<Cache<Addr, Arc<TableIndex>>>,
}

impl IndexCache {
    pub fn new(capacity: u64) -> IndexCache {
        IndexCache {
            cache: Mutex::new(Cache::new(capacity, None)),
        }
    }

    pub fn get(&self, name: &Addr) -> Option<Arc<TableIndex>> {
        self.cache.lock().unwrap().get(name)
    }

    pub fn insert(&self, name: Addr, index: Arc<TableIndex>) {
        let weight = index.weight();
        self.cache.lock().unwrap().insert(name, index, weight);
    }
}

/// Bounded LRU of open table file handles. Callers receive an `Arc<File>`
/// pin: a handle evicted mid-read stays open until the reader's clone
/// drops, so outstanding preads never race a close.
pub struct FdCache {
    cache: Mutex<Cache<PathBuf, Arc<File>>>,
}

impl FdCache {
    pub fn new(capacity: usize) -> FdCache {
        FdCache {
            cache: Mutex::new(Cache::new(capacity as u64, None)),
        }
    }

    /// Returns the cached handle for the path, opening it on a miss.
    pub fn open(&self, path: &Path) -> Result<Arc<File>> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(file) = cache.get(&path.to_path_buf()) {
            return Ok(file);
        }
        let file = Arc::new(File::open(path)?);
        cache.insert(path.to_path_buf(), file.clone(), 1);
        Ok(file)
    }
}

/// Process-wide resource budgets shared by the stores constructed over it:
/// the index cache, the FD cache, and the manifest cache plus in-process
/// manifest locks. Stores that should share budgets share a `Runtime`;
/// isolated stores get their own.
pub struct Runtime {
    pub(crate) index_cache: Arc<IndexCache>,
    pub(crate) fd_cache: Arc<FdCache>,
    pub(crate) manifest_cache: Arc<ManifestCache>,
    pub(crate) manifest_locks: Arc<ManifestLocks>,
}

impl Runtime {
    pub fn new(config: &StoreConfig) -> Arc<Runtime> {
        Arc::new(Runtime {
            index_cache: Arc::new(IndexCache::new(config.index_cache_size)),
            fd_cache: Arc::new(FdCache::new(config.max_tables)),
            manifest_cache: Arc::new(ManifestCache::new(config.manifest_cache_size)),
            manifest_locks: Arc::new(ManifestLocks::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_fd_cache_caps_open_handles() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let cache = FdCache::new(2);

        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("t{i}"));
                std::fs::write(&p, b"x").unwrap();
                p
            })
            .collect();

        let first = cache.open(&paths[0])?;
        cache.open(&paths[1])?;
        cache.open(&paths[2])?;

        assert_eq!(cache.cache.lock().unwrap().len(), 2);
        // The pin held above keeps the evicted handle usable.
        assert!(first.metadata().is_ok());
        Ok(())
    }

    #[test]
    fn test_fd_cache_returns_same_handle() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t");
        std::fs::write(&path, b"x").unwrap();

        let cache = FdCache::new(4);
        let a = cache.open(&path)?;
        let b = cache.open(&path)?;
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }
}
