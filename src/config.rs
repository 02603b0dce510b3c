/// Version of the on-disk storage format. Written as the first field of
/// every manifest; stores refuse manifests tagged with any other value.
pub const STORAGE_VERSION: &str = "4";

/// Default repository data format tag carried through the manifest. The
/// store does not interpret it beyond checking that readers and writers
/// agree.
pub const DEFAULT_DATA_VERSION: &str = "5";

pub const DEFAULT_MEM_TABLE_SIZE: u64 = 128 * (1 << 20);
pub const DEFAULT_MAX_TABLES: usize = 256;
pub const DEFAULT_INDEX_CACHE_SIZE: u64 = 8 * (1 << 20);
pub const DEFAULT_MANIFEST_CACHE_SIZE: u64 = 8 * (1 << 20);
pub const DEFAULT_PREFLUSH_CHUNK_COUNT: u32 = 8;

/// Configuration for a block store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Target memtable byte budget before rotation (default: 128 MiB).
    pub mem_table_size: u64,

    /// Upstream table count above which commit conjoins (default: 256).
    pub max_tables: usize,

    /// Byte budget for the shared parsed-index cache (default: 8 MiB).
    pub index_cache_size: u64,

    /// Byte budget for the in-process manifest cache (default: 8 MiB).
    pub manifest_cache_size: u64,

    /// Memtables holding more than this many chunks at commit entry are
    /// flushed before taking the manifest update lock (default: 8).
    pub preflush_chunk_count: u32,

    /// Repository data format tag written to the manifest.
    pub data_version: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mem_table_size: DEFAULT_MEM_TABLE_SIZE,
            max_tables: DEFAULT_MAX_TABLES,
            index_cache_size: DEFAULT_INDEX_CACHE_SIZE,
            manifest_cache_size: DEFAULT_MANIFEST_CACHE_SIZE,
            preflush_chunk_count: DEFAULT_PREFLUSH_CHUNK_COUNT,
            data_version: DEFAULT_DATA_VERSION.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memtable byte budget.
    pub fn mem_table_size(mut self, size: u64) -> Self {
        self.mem_table_size = size;
        self
    }

    /// Set the conjoin threshold.
    pub fn max_tables(mut self, count: usize) -> Self {
        self.max_tables = count;
        self
    }

    /// Set the parsed-index cache budget.
    pub fn index_cache_size(mut self, size: u64) -> Self {
        self.index_cache_size = size;
        self
    }

    /// Set the manifest cache budget.
    pub fn manifest_cache_size(mut self, size: u64) -> Self {
        self.manifest_cache_size = size;
        self
    }

    /// Set the preflush chunk count.
    pub fn preflush_chunk_count(mut self, count: u32) -> Self {
        self.preflush_chunk_count = count;
        self
    }

    /// Set the repository data format tag.
    pub fn data_version(mut self, vers: impl Into<String>) -> Self {
        self.data_version = vers.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.mem_table_size, 128 * (1 << 20));
        assert_eq!(config.max_tables, 256);
        assert_eq!(config.index_cache_size, 8 * (1 << 20));
        assert_eq!(config.manifest_cache_size, 8 * (1 << 20));
        assert_eq!(config.preflush_chunk_count, 8);
        assert_eq!(config.data_version, DEFAULT_DATA_VERSION);
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new()
            .mem_table_size(1 << 20)
            .max_tables(4)
            .preflush_chunk_count(2)
            .data_version("7");

        assert_eq!(config.mem_table_size, 1 << 20);
        assert_eq!(config.max_tables, 4);
        assert_eq!(config.preflush_chunk_count, 2);
        assert_eq!(config.data_version, "7");
    }
}
