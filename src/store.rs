//! The block store facade.
//!
//! Coordinates the memtable, the table set, the persister, the manifest
//! manager, and the conjoiner behind the public `put`/`get`/`commit`
//! surface.
//!
//! # Commit Protocol
//!
//! A commit advances the store's root from `last` to `current` under the
//! in-process manifest update lock:
//!
//! ```text
//! IDLE -> PREP (flush memtable) -> CAS -> { COMMITTED | RECONCILE }
//! RECONCILE -> CAS     on a tables-only conflict
//! RECONCILE -> FAILED  on a root conflict; commit returns Ok(false)
//! ```
//!
//! A lost CAS whose winner kept our root (`last`) means other writers only
//! added tables; the commit absorbs their specs and retries as long as it
//! takes. A winner that moved the root surfaces as `Ok(false)`: the caller
//! must rebase, rebuild its commit against the new root, and try again.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};

use crate::chunk::Chunk;
use crate::config::StoreConfig;
use crate::conjoin::InlineConjoiner;
use crate::errdata;
use crate::error::{Error, Result};
use crate::hash::Addr;
use crate::manifest::blob::BlobManifest;
use crate::manifest::file::{check_dir, FileManifest};
use crate::manifest::{
    generate_lock_hash, ManifestContents, ManifestManager, TableSpec,
};
use crate::memtable::MemTable;
use crate::persist::{Blobstore, BlobstorePersister, FsTablePersister, TablePersister};
use crate::runtime::Runtime;
use crate::stats::{Stats, StatsSnapshot};
use crate::table::{to_get_records, to_has_records, ChunkLocation};
use crate::tableset::TableSet;

/// A content-addressed chunk store over one manifest and its table files.
/// All operations are safe to call concurrently from independent threads.
pub struct BlockStore {
    mm: ManifestManager,
    p: Arc<dyn TablePersister>,
    c: InlineConjoiner,

    mt_size: u64,
    preflush_chunk_count: u32,

    inner: RwLock<Inner>,
    stats: Arc<Stats>,
}

/// The mutable quartet guarded by the facade's readers/writer lock. Reads
/// snapshot `tables` (cheap `Arc` clones) and release the lock before
/// performing I/O.
struct Inner {
    mt: Option<MemTable>,
    tables: TableSet,
    upstream: ManifestContents,
    put_count: u64,
}

/// Why one commit attempt did not land. Only `Store` carries a real error;
/// the other cases steer the retry loop.
enum CommitFailure {
    /// The caller's `last` never matched our upstream root.
    LastRootMismatch,
    /// A concurrent writer moved the root; the caller must rebuild.
    RootMoved,
    /// A concurrent writer added tables but kept our root; retry.
    TablesChanged,
    Store(Error),
}

impl From<Error> for CommitFailure {
    fn from(e: Error) -> Self {
        CommitFailure::Store(e)
    }
}

impl BlockStore {
    /// Opens a store over a local directory: one `manifest` file plus one
    /// file per table, named by its base32 address.
    pub fn local(
        dir: impl AsRef<Path>,
        config: StoreConfig,
        runtime: &Arc<Runtime>,
    ) -> Result<BlockStore> {
        let dir = dir.as_ref();
        check_dir(dir)?;
        let mm = ManifestManager::new(
            Arc::new(FileManifest::new(dir)),
            runtime.manifest_cache.clone(),
            runtime.manifest_locks.clone(),
        );
        let p = Arc::new(FsTablePersister::new(
            dir,
            runtime.fd_cache.clone(),
            runtime.index_cache.clone(),
        ));
        Self::open(mm, p, config)
    }

    /// Opens a store over a blobstore. `name` identifies the store (e.g. a
    /// bucket/prefix pair) for in-process coordination; handles addressing
    /// the same objects must agree on it.
    pub fn blob(
        bs: Arc<dyn Blobstore>,
        name: impl Into<String>,
        config: StoreConfig,
        runtime: &Arc<Runtime>,
    ) -> Result<BlockStore> {
        let mm = ManifestManager::new(
            Arc::new(BlobManifest::new(bs.clone(), name)),
            runtime.manifest_cache.clone(),
            runtime.manifest_locks.clone(),
        );
        let p = Arc::new(BlobstorePersister::new(bs, runtime.index_cache.clone()));
        Self::open(mm, p, config)
    }

    fn open(
        mm: ManifestManager,
        p: Arc<dyn TablePersister>,
        config: StoreConfig,
    ) -> Result<BlockStore> {
        let stats = Arc::new(Stats::new());
        let mut tables = TableSet::new(p.clone());
        let mut upstream = ManifestContents::empty(config.data_version.clone());

        if let Some(contents) = mm.fetch(&stats)? {
            if contents.vers != config.data_version {
                return errdata!(
                    "store is data format {:?}, this store expects {:?}",
                    contents.vers,
                    config.data_version
                );
            }
            tables = tables.rebase(&contents.specs, &stats)?;
            upstream = contents;
        }

        Ok(BlockStore {
            mm,
            p,
            c: InlineConjoiner::new(config.max_tables),
            mt_size: config.mem_table_size,
            preflush_chunk_count: config.preflush_chunk_count,
            inner: RwLock::new(Inner {
                mt: None,
                tables,
                upstream,
                put_count: 0,
            }),
            stats,
        })
    }

    /// Buffers a chunk. Not durable until [`BlockStore::commit`]. Fails
    /// only if the chunk cannot fit even a fresh memtable.
    pub fn put(&self, chunk: Chunk) -> Result<()> {
        let (addr, data) = chunk.into_parts();
        let mut inner = self.inner.write().map_err(Error::from)?;

        let fits = inner
            .mt
            .as_ref()
            .map_or(true, |mt| mt.fits(&addr, data.len()));
        if !fits {
            let sealed = inner.mt.take().expect("checked above");
            inner.tables = inner.tables.prepend(Arc::new(sealed));
        }
        if inner.mt.is_none() {
            inner.mt = Some(MemTable::new(self.mt_size));
        }
        if !inner.mt.as_mut().unwrap().add_chunk(addr, data) {
            return Err(Error::AddChunkFailed);
        }
        inner.put_count += 1;
        self.stats.record_put();
        Ok(())
    }

    /// Reads a chunk, or `None` if the store does not hold it. A missing
    /// chunk is not an error.
    pub fn get(&self, addr: &Addr) -> Result<Option<Chunk>> {
        self.stats.record_get();
        let (buffered, tables) = {
            let inner = self.inner.read().map_err(Error::from)?;
            let buffered = inner
                .mt
                .as_ref()
                .and_then(|mt| mt.get(addr))
                .map(|data| data.to_vec());
            (buffered, inner.tables.clone())
        };

        if let Some(data) = buffered {
            self.stats.record_get_hit_mem();
            return Ok(Some(Chunk::with_addr(*addr, data)));
        }
        match tables.get(addr)? {
            Some(data) => {
                self.stats.record_get_hit_table();
                Ok(Some(Chunk::with_addr(*addr, data)))
            }
            None => Ok(None),
        }
    }

    /// Delivers every requested chunk the store holds through `sink`;
    /// absent addresses are simply not delivered. Returns once all lookups
    /// complete. Chunks named by the manifest but unreadable surface as one
    /// aggregated [`Error::Fetch`] after the rest of the batch lands.
    pub fn get_many(&self, addrs: &[Addr], sink: &Sender<Chunk>) -> Result<()> {
        let mut reqs = to_get_records(addrs);
        if reqs.is_empty() {
            return Ok(());
        }
        self.stats.record_get();

        let (remaining, tables) = {
            let inner = self.inner.read().map_err(Error::from)?;
            let mut remaining = true;
            if let Some(mt) = &inner.mt {
                remaining = mt.get_many(&mut reqs, sink)?;
            }
            (remaining, inner.tables.clone())
        };

        if remaining {
            tables.get_many(&mut reqs, sink)?;
        }
        Ok(())
    }

    pub fn has(&self, addr: &Addr) -> Result<bool> {
        self.stats.record_has(1);
        let (buffered, tables) = {
            let inner = self.inner.read().map_err(Error::from)?;
            let buffered = inner.mt.as_ref().is_some_and(|mt| mt.has(addr));
            (buffered, inner.tables.clone())
        };
        if buffered {
            return Ok(true);
        }
        tables.has(addr)
    }

    /// Returns the subset of `addrs` the store does not hold.
    pub fn has_many(&self, addrs: &[Addr]) -> Result<HashSet<Addr>> {
        let mut reqs = to_has_records(addrs);
        self.stats.record_has(reqs.len() as u64);

        let (remaining, tables) = {
            let inner = self.inner.read().map_err(Error::from)?;
            let mut remaining = true;
            if let Some(mt) = &inner.mt {
                remaining = mt.has_many(&mut reqs);
            }
            (remaining, inner.tables.clone())
        };

        if remaining {
            tables.has_many(&mut reqs)?;
        }
        Ok(reqs.iter().filter(|r| !r.has).map(|r| r.addr).collect())
    }

    /// The last-known committed root. May be stale with respect to other
    /// processes; call [`BlockStore::rebase`] to refresh.
    pub fn root(&self) -> Result<Addr> {
        let inner = self.inner.read().map_err(Error::from)?;
        Ok(inner.upstream.root)
    }

    /// Refreshes the upstream view from the manifest without writing.
    pub fn rebase(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(Error::from)?;
        if let Some(contents) = self.mm.fetch(&self.stats)? {
            inner.tables = inner.tables.rebase(&contents.specs, &self.stats)?;
            inner.upstream = contents;
        }
        Ok(())
    }

    /// Attempts to advance the root from `last` to `current`, publishing
    /// all buffered chunks. `Ok(false)` means a concurrent writer moved the
    /// root (or `last` was already stale): nothing was written, and the
    /// caller must rebase, rebuild against the new root, and retry.
    pub fn commit(&self, current: Addr, last: Addr) -> Result<bool> {
        let any_novel = {
            let inner = self.inner.read().map_err(Error::from)?;
            inner.mt.as_ref().is_some_and(|mt| !mt.is_empty()) || inner.tables.novel_count() > 0
        };
        if !any_novel && current == last {
            self.rebase()?;
            return Ok(true);
        }

        // Serializing a non-trivial memtable is the slow part of a commit;
        // do it before taking the update lock so other in-process
        // committers are not stuck behind the serialization.
        {
            let mut inner = self.inner.write().map_err(Error::from)?;
            let preflush = inner
                .mt
                .as_ref()
                .is_some_and(|mt| mt.count() > self.preflush_chunk_count);
            if preflush {
                let sealed = inner.mt.take().expect("checked above");
                inner.tables = inner.tables.prepend(Arc::new(sealed));
                inner.tables.to_specs(&self.stats)?;
            }
        }

        let _guard = self.mm.lock_for_update();
        loop {
            match self.try_commit(current, last) {
                Ok(()) => {
                    self.stats.record_commit();
                    tracing::info!(root = %current, "committed");
                    return Ok(true);
                }
                Err(CommitFailure::LastRootMismatch) => {
                    tracing::debug!(%current, %last, "commit refused: last root mismatch");
                    return Ok(false);
                }
                Err(CommitFailure::RootMoved) => {
                    tracing::debug!(%current, %last, "commit lost: root moved");
                    return Ok(false);
                }
                Err(CommitFailure::TablesChanged) => {
                    // Another writer added tables under our root; our
                    // intended root is still coherent with the enlarged
                    // spec set, so retry until it lands.
                    self.stats.record_commit_retry();
                    continue;
                }
                Err(CommitFailure::Store(e)) => return Err(e),
            }
        }
    }

    fn try_commit(&self, current: Addr, last: Addr) -> std::result::Result<(), CommitFailure> {
        let mut inner = self.inner.write().map_err(Error::from)?;
        if inner.upstream.root != last {
            return Err(CommitFailure::LastRootMismatch);
        }

        // Another in-process writer may already have observed a manifest
        // our lock can't beat; skip the doomed round-trip.
        if let Some(cached) = self.mm.update_will_fail(&inner.upstream.lock) {
            tracing::debug!(manifest = self.mm.name(), "commit doomed by cached manifest");
            return self.reconcile(&mut inner, cached, last);
        }

        match inner.mt.take() {
            Some(mt) if !mt.is_empty() => {
                inner.tables = inner.tables.prepend(Arc::new(mt));
            }
            _ => {}
        }

        if self.c.conjoin_required(&inner.tables) {
            let conjoined = self
                .c
                .conjoin(&inner.upstream, &self.mm, self.p.as_ref(), &self.stats)?;
            inner.tables = inner.tables.rebase(&conjoined.specs, &self.stats)?;
            inner.upstream = conjoined;
            return Err(CommitFailure::TablesChanged);
        }

        let specs = inner.tables.to_specs(&self.stats)?;
        let new_contents = ManifestContents {
            vers: inner.upstream.vers.clone(),
            root: current,
            lock: generate_lock_hash(&current, &specs),
            specs,
        };

        let winner = self
            .mm
            .update(inner.upstream.lock, new_contents.clone(), &self.stats)?;
        if winner.lock != new_contents.lock {
            return self.reconcile(&mut inner, winner, last);
        }

        inner.upstream = new_contents;
        inner.tables = inner.tables.flatten();
        Ok(())
    }

    /// Adopts a winning manifest after a lost (or doomed) CAS and reports
    /// whether the conflict is retryable.
    fn reconcile(
        &self,
        inner: &mut Inner,
        winner: ManifestContents,
        last: Addr,
    ) -> std::result::Result<(), CommitFailure> {
        inner.tables = inner.tables.rebase(&winner.specs, &self.stats)?;
        let root_moved = winner.root != last;
        inner.upstream = winner;
        if root_moved {
            Err(CommitFailure::RootMoved)
        } else {
            Err(CommitFailure::TablesChanged)
        }
    }

    /// Appends externally-produced table specs to the manifest without
    /// moving the root. Tables already named by the manifest are skipped.
    /// Returns the manifest contents after the update.
    pub fn update_manifest(&self, updates: &HashMap<Addr, u32>) -> Result<ManifestContents> {
        let _guard = self.mm.lock_for_update();
        let mut inner = self.inner.write().map_err(Error::from)?;

        let mut contents = self
            .mm
            .fetch(&self.stats)?
            .unwrap_or_else(|| ManifestContents::empty(inner.upstream.vers.clone()));

        let current: HashSet<Addr> = contents.specs.iter().map(|s| s.name).collect();
        let mut added = 0;
        for (name, chunk_count) in updates {
            if !current.contains(name) {
                contents.specs.push(TableSpec {
                    name: *name,
                    chunk_count: *chunk_count,
                });
                added += 1;
            }
        }
        if added == 0 {
            return Ok(contents);
        }

        let prev_lock = contents.lock;
        contents.lock = generate_lock_hash(&contents.root, &contents.specs);
        let winner = self.mm.update(prev_lock, contents, &self.stats)?;

        inner.tables = inner.tables.rebase(&winner.specs, &self.stats)?;
        inner.upstream = winner.clone();
        tracing::info!(added, tables = winner.specs.len(), "appended tables to manifest");
        Ok(winner)
    }

    /// Resolves the requested chunks to byte ranges within persisted
    /// tables, for serving the remote protocol:
    /// `table name -> chunk address -> range`. Chunks still buffered in an
    /// unserialized memtable have no physical range and are omitted.
    pub fn get_chunk_locations(
        &self,
        addrs: &[Addr],
    ) -> Result<HashMap<Addr, HashMap<Addr, ChunkLocation>>> {
        let tables = {
            let inner = self.inner.read().map_err(Error::from)?;
            inner.tables.clone()
        };

        let mut remaining: Vec<Addr> = {
            let set: HashSet<Addr> = addrs.iter().copied().collect();
            set.into_iter().collect()
        };
        let mut out = HashMap::new();
        for cs in tables.sources() {
            if remaining.is_empty() {
                break;
            }
            let found = cs.chunk_ranges(&mut remaining)?;
            if !found.is_empty() {
                out.entry(cs.name())
                    .or_insert_with(HashMap::new)
                    .extend(found);
            }
        }
        Ok(out)
    }

    /// Estimates the physical read operations needed to fetch the given
    /// chunks, for clients that pay per request. Fails if any chunk is
    /// absent.
    pub fn calc_reads(&self, addrs: &[Addr], block_size: u64) -> Result<(usize, bool)> {
        let mut reqs = to_get_records(addrs);
        let tables = {
            let inner = self.inner.read().map_err(Error::from)?;
            inner.tables.clone()
        };
        let (reads, split, remaining) = tables.calc_reads(&mut reqs, block_size)?;
        if remaining {
            return Err(Error::Fetch("not all requested chunks are present".to_string()));
        }
        Ok((reads, split))
    }

    /// Total chunk count across the memtable and all tables.
    pub fn count(&self) -> Result<u32> {
        let inner = self.inner.read().map_err(Error::from)?;
        Ok(inner.mt.as_ref().map_or(0, |mt| mt.count()) + inner.tables.count())
    }

    /// The repository data format tag this store was opened with.
    pub fn version(&self) -> Result<String> {
        let inner = self.inner.read().map_err(Error::from)?;
        Ok(inner.upstream.vers.clone())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// One-line human summary of the store's state.
    pub fn stats_summary(&self) -> Result<String> {
        let inner = self.inner.read().map_err(Error::from)?;
        Ok(format!(
            "root: {}; tables: {}; chunks: {}; physical bytes: {}; puts: {}",
            inner.upstream.root,
            inner.tables.novel_count() + inner.tables.upstream_count(),
            inner.mt.as_ref().map_or(0, |mt| mt.count()) + inner.tables.count(),
            inner.tables.physical_len(),
            inner.put_count,
        ))
    }

    /// Releases the memtable and all table handles. Uncommitted chunks are
    /// dropped; cache pins resolve as outstanding readers finish.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().map_err(Error::from)?;
        if let Some(mt) = &inner.mt {
            if !mt.is_empty() {
                tracing::warn!(
                    chunks = mt.count(),
                    "closing store with uncommitted buffered chunks"
                );
            }
        }
        inner.mt = None;
        inner.tables = TableSet::new(self.p.clone());
        Ok(())
    }
}
