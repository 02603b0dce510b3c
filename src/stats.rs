use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for one store. All counters are monotonic and safe to
/// read while the store is in use.
#[derive(Debug, Default)]
pub struct Stats {
    puts: AtomicU64,
    gets: AtomicU64,
    get_hits_mem: AtomicU64,
    get_hits_table: AtomicU64,
    has_checks: AtomicU64,
    physical_reads: AtomicU64,
    bytes_read: AtomicU64,
    tables_persisted: AtomicU64,
    bytes_persisted: AtomicU64,
    commits: AtomicU64,
    commit_retries: AtomicU64,
    conjoins: AtomicU64,
    manifest_fetches: AtomicU64,
    manifest_updates: AtomicU64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_hit_mem(&self) {
        self.get_hits_mem.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_hit_table(&self) {
        self.get_hits_table.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_has(&self, count: u64) {
        self.has_checks.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_physical_read(&self, bytes: u64) {
        self.physical_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_table_persisted(&self, bytes: u64) {
        self.tables_persisted.fetch_add(1, Ordering::Relaxed);
        self.bytes_persisted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_retry(&self) {
        self.commit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conjoin(&self) {
        self.conjoins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manifest_fetch(&self) {
        self.manifest_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manifest_update(&self) {
        self.manifest_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            get_hits_mem: self.get_hits_mem.load(Ordering::Relaxed),
            get_hits_table: self.get_hits_table.load(Ordering::Relaxed),
            has_checks: self.has_checks.load(Ordering::Relaxed),
            physical_reads: self.physical_reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            tables_persisted: self.tables_persisted.load(Ordering::Relaxed),
            bytes_persisted: self.bytes_persisted.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_retries: self.commit_retries.load(Ordering::Relaxed),
            conjoins: self.conjoins.load(Ordering::Relaxed),
            manifest_fetches: self.manifest_fetches.load(Ordering::Relaxed),
            manifest_updates: self.manifest_updates.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`Stats`] counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub puts: u64,
    pub gets: u64,
    pub get_hits_mem: u64,
    pub get_hits_table: u64,
    pub has_checks: u64,
    pub physical_reads: u64,
    pub bytes_read: u64,
    pub tables_persisted: u64,
    pub bytes_persisted: u64,
    pub commits: u64,
    pub commit_retries: u64,
    pub conjoins: u64,
    pub manifest_fetches: u64,
    pub manifest_updates: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::new();
        stats.record_put();
        stats.record_put();
        stats.record_physical_read(128);
        stats.record_physical_read(64);
        stats.record_has(3);

        let snap = stats.snapshot();
        assert_eq!(snap.puts, 2);
        assert_eq!(snap.physical_reads, 2);
        assert_eq!(snap.bytes_read, 192);
        assert_eq!(snap.has_checks, 3);
        assert_eq!(snap.commits, 0);
    }
}
