//! The manifest: a single durable record naming the store's current root
//! and its table files.
//!
//! Every backend stores one mutable record
//! `{version, lock, root, [(tableHash, count)]}` and offers a
//! compare-and-set keyed on `lock`, a commitment over `(root, specs)`.
//! Writers race through that CAS; a loser observes the winner's contents
//! and reconciles. The manager layered on top adds an in-process cache of
//! the most recently observed contents (to short-circuit known-lost races
//! without I/O) and in-process locks so same-process writers queue instead
//! of trampling each other on the backend.
//!
//! # Record Format (file backend)
//!
//! One line of `:`-separated fields, written atomically via a temp file
//! rename while holding an exclusive flock:
//!
//! ```text
//! <storageVersion>:<dataVersion>:<lockHash>:<rootHash>[:<tableHash>:<count>]*
//! ```

pub mod blob;
pub mod file;

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use crate::cache::Cache;
use crate::config::STORAGE_VERSION;
use crate::errdata;
use crate::error::Result;
use crate::hash::{Addr, ADDR_LEN};
use crate::stats::Stats;

/// Names one table file: its content address and chunk count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: Addr,
    pub chunk_count: u32,
}

/// The decoded state of a manifest record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestContents {
    /// Repository data format tag; readers and writers must agree.
    pub vers: String,
    /// Commitment over `(root, specs)`; the CAS token.
    pub lock: Addr,
    /// The repository's current top-of-graph hash.
    pub root: Addr,
    /// Tables holding the store's chunks, read-priority order.
    pub specs: Vec<TableSpec>,
}

impl ManifestContents {
    /// The contents of a store that has never committed: zero root, zero
    /// lock, no tables.
    pub fn empty(vers: impl Into<String>) -> ManifestContents {
        ManifestContents {
            vers: vers.into(),
            lock: Addr::default(),
            root: Addr::default(),
            specs: Vec::new(),
        }
    }

    /// Approximate in-memory size, for cache accounting.
    pub fn weight(&self) -> u64 {
        (std::mem::size_of::<ManifestContents>()
            + self.vers.len()
            + self.specs.len() * std::mem::size_of::<TableSpec>()) as u64
    }
}

/// Computes the CAS commitment over a root and spec list. Any change to the
/// root or to the table set yields a different lock.
pub fn generate_lock_hash(root: &Addr, specs: &[TableSpec]) -> Addr {
    let mut buf = Vec::with_capacity(ADDR_LEN + specs.len() * (ADDR_LEN + 4));
    buf.extend_from_slice(root.as_bytes());
    for spec in specs {
        buf.extend_from_slice(spec.name.as_bytes());
        buf.extend_from_slice(&spec.chunk_count.to_be_bytes());
    }
    Addr::of(&buf)
}

/// Serializes contents to the one-line record format.
pub(crate) fn format_line(contents: &ManifestContents) -> String {
    let mut line = format!(
        "{STORAGE_VERSION}:{}:{}:{}",
        contents.vers, contents.lock, contents.root
    );
    for spec in &contents.specs {
        line.push_str(&format!(":{}:{}", spec.name, spec.chunk_count));
    }
    line
}

/// Parses the one-line record format.
pub(crate) fn parse_line(line: &str) -> Result<ManifestContents> {
    let fields: Vec<&str> = line.trim_end().split(':').collect();
    if fields.len() < 4 {
        return errdata!("manifest record has {} fields, need at least 4", fields.len());
    }
    if fields[0] != STORAGE_VERSION {
        return errdata!(
            "unsupported storage version {:?}, this build reads {STORAGE_VERSION:?}",
            fields[0]
        );
    }
    if fields.len() % 2 != 0 {
        return errdata!("manifest table list must be (hash, count) pairs");
    }
    let mut contents = ManifestContents {
        vers: fields[1].to_string(),
        lock: fields[2].parse()?,
        root: fields[3].parse()?,
        specs: Vec::with_capacity((fields.len() - 4) / 2),
    };
    for pair in fields[4..].chunks(2) {
        let name: Addr = pair[0].parse()?;
        let chunk_count: u32 = pair[1]
            .parse()
            .map_err(|_| crate::error::Error::InvalidData(format!("bad chunk count {:?}", pair[1])))?;
        contents.specs.push(TableSpec { name, chunk_count });
    }
    Ok(contents)
}

/// One manifest backend: filesystem, blobstore, or anything else with a
/// native compare-and-set.
pub trait Manifest: Send + Sync {
    /// A stable identity for this manifest, keying the in-process cache and
    /// locks. Two handles to the same underlying record must agree.
    fn name(&self) -> &str;

    /// Reads the current contents, or `None` if the store has never been
    /// committed to.
    fn fetch(&self, stats: &Stats) -> Result<Option<ManifestContents>>;

    /// Attempts to replace the record: succeeds only if the stored lock
    /// still equals `prev_lock`. Returns the record's contents afterwards,
    /// which are `new` on success and the concurrent winner's otherwise.
    fn update(
        &self,
        prev_lock: Addr,
        new: ManifestContents,
        stats: &Stats,
    ) -> Result<ManifestContents>;
}

/// In-process cache of the most recently observed contents per manifest.
pub struct ManifestCache {
    cache: Mutex<Cache<String, ManifestContents>>,
}

impl ManifestCache {
    pub fn new(capacity: u64) -> ManifestCache {
        ManifestCache {
            cache: Mutex::new(Cache::new(capacity, None)),
        }
    }

    pub fn get(&self, name: &str) -> Option<ManifestContents> {
        self.cache.lock().unwrap().get(&name.to_string())
    }

    pub fn insert(&self, name: &str, contents: ManifestContents) {
        let weight = contents.weight();
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), contents, weight);
    }
}

/// In-process writer locks, keyed by manifest name. Serializes same-process
/// commits so losers reconcile against the in-process cache instead of
/// burning backend round-trips.
pub struct ManifestLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl ManifestLocks {
    pub fn new() -> ManifestLocks {
        ManifestLocks {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    fn lock(&self, name: &str) {
        let mut held = self.held.lock().unwrap();
        while held.contains(name) {
            held = self.released.wait(held).unwrap();
        }
        held.insert(name.to_string());
    }

    fn unlock(&self, name: &str) {
        let mut held = self.held.lock().unwrap();
        held.remove(name);
        self.released.notify_all();
    }
}

impl Default for ManifestLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the in-process update lock on drop.
pub struct UpdateGuard<'a> {
    locks: &'a ManifestLocks,
    name: String,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(&self.name);
    }
}

/// A manifest backend plus the in-process coordination layered over it.
#[derive(Clone)]
pub struct ManifestManager {
    m: Arc<dyn Manifest>,
    cache: Arc<ManifestCache>,
    locks: Arc<ManifestLocks>,
}

impl ManifestManager {
    pub fn new(
        m: Arc<dyn Manifest>,
        cache: Arc<ManifestCache>,
        locks: Arc<ManifestLocks>,
    ) -> ManifestManager {
        ManifestManager { m, cache, locks }
    }

    pub fn name(&self) -> &str {
        self.m.name()
    }

    /// Blocks until this process's update lock for the manifest is held.
    pub fn lock_for_update(&self) -> UpdateGuard<'_> {
        self.locks.lock(self.m.name());
        UpdateGuard {
            locks: &self.locks,
            name: self.m.name().to_string(),
        }
    }

    /// Reads the backend and refreshes the cache.
    pub fn fetch(&self, stats: &Stats) -> Result<Option<ManifestContents>> {
        let contents = self.m.fetch(stats)?;
        if let Some(contents) = &contents {
            self.cache.insert(self.m.name(), contents.clone());
        }
        Ok(contents)
    }

    /// Consults only the in-process cache: if another writer in this
    /// process has already observed contents whose lock differs from
    /// `prev_lock`, a CAS from `prev_lock` is doomed and the cached
    /// contents are returned for reconciliation without touching the
    /// backend.
    pub fn update_will_fail(&self, prev_lock: &Addr) -> Option<ManifestContents> {
        let cached = self.cache.get(self.m.name())?;
        if cached.lock != *prev_lock {
            Some(cached)
        } else {
            None
        }
    }

    /// Runs the backend CAS and caches whatever contents win.
    pub fn update(
        &self,
        prev_lock: Addr,
        new: ManifestContents,
        stats: &Stats,
    ) -> Result<ManifestContents> {
        let winner = self.m.update(prev_lock, new, stats)?;
        self.cache.insert(self.m.name(), winner.clone());
        Ok(winner)
    }
}
