use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::hash::Addr;
use crate::manifest::TableSpec;
use crate::memtable::MemTable;
use crate::persist::TablePersister;
use crate::stats::Stats;
use crate::table::{ChunkSource, GetRecord, HasRecord};

/// A sealed memtable that has entered the novel layer but may not have
/// been serialized yet. Serialization is deferred until the table set is
/// asked for manifest specs.
#[derive(Clone)]
enum NovelTable {
    Pending(Arc<MemTable>),
    Persisted(Arc<dyn ChunkSource>),
}

/// The tiered read stack: novel tables written this session but absent
/// from the manifest, stacked over the upstream tables the manifest names.
/// Within each layer, younger tables shadow older ones; reads stop at the
/// first hit.
///
/// Table sets are persistent values: every mutation returns a new set
/// sharing table handles with its predecessor, so readers that snapshotted
/// an older generation keep reading it safely while the facade swaps in
/// the new one.
#[derive(Clone)]
pub struct TableSet {
    /// newest first
    novel: Vec<NovelTable>,
    /// manifest order
    upstream: Vec<Arc<dyn ChunkSource>>,
    p: Arc<dyn TablePersister>,
}

impl TableSet {
    pub fn new(p: Arc<dyn TablePersister>) -> TableSet {
        TableSet {
            novel: Vec::new(),
            upstream: Vec::new(),
            p,
        }
    }

    /// Returns a new set with the sealed memtable stacked on top as a
    /// pending novel table.
    pub fn prepend(&self, mt: Arc<MemTable>) -> TableSet {
        let mut novel = Vec::with_capacity(self.novel.len() + 1);
        novel.push(NovelTable::Pending(mt));
        novel.extend(self.novel.iter().cloned());
        TableSet {
            novel,
            upstream: self.upstream.clone(),
            p: self.p.clone(),
        }
    }

    pub fn novel_count(&self) -> usize {
        self.novel.len()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstream.len()
    }

    /// Total chunks across all layers. Chunks duplicated between tables
    /// are counted once per table that holds them.
    pub fn count(&self) -> u32 {
        let novel: u32 = self
            .novel
            .iter()
            .map(|t| match t {
                NovelTable::Pending(mt) => mt.count(),
                NovelTable::Persisted(cs) => cs.count(),
            })
            .sum();
        novel + self.upstream.iter().map(|cs| cs.count()).sum::<u32>()
    }

    /// Total stored bytes; pending tables contribute their buffered data
    /// length.
    pub fn physical_len(&self) -> u64 {
        let novel: u64 = self
            .novel
            .iter()
            .map(|t| match t {
                NovelTable::Pending(mt) => mt.data_len(),
                NovelTable::Persisted(cs) => cs.physical_len(),
            })
            .sum();
        novel + self.upstream.iter().map(|cs| cs.physical_len()).sum::<u64>()
    }

    /// The persisted tables of the stack, novel first, in read-priority
    /// order. Pending tables have no physical form yet and are skipped.
    pub fn sources(&self) -> impl Iterator<Item = &Arc<dyn ChunkSource>> {
        self.novel
            .iter()
            .filter_map(|t| match t {
                NovelTable::Pending(_) => None,
                NovelTable::Persisted(cs) => Some(cs),
            })
            .chain(self.upstream.iter())
    }

    pub fn get(&self, addr: &Addr) -> Result<Option<Vec<u8>>> {
        for t in &self.novel {
            match t {
                NovelTable::Pending(mt) => {
                    if let Some(data) = mt.get(addr) {
                        return Ok(Some(data.to_vec()));
                    }
                }
                NovelTable::Persisted(cs) => {
                    if let Some(data) = cs.get(addr)? {
                        return Ok(Some(data));
                    }
                }
            }
        }
        for cs in &self.upstream {
            if let Some(data) = cs.get(addr)? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    pub fn has(&self, addr: &Addr) -> Result<bool> {
        for t in &self.novel {
            let has = match t {
                NovelTable::Pending(mt) => mt.has(addr),
                NovelTable::Persisted(cs) => cs.has(addr)?,
            };
            if has {
                return Ok(true);
            }
        }
        for cs in &self.upstream {
            if cs.has(addr)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Serves all still-unfound records this stack holds through `sink`.
    /// Tables that fail to read are skipped so the rest of the batch still
    /// lands; their failures surface as one aggregated error afterwards.
    /// Returns whether any record remains unserved.
    pub fn get_many(&self, reqs: &mut [GetRecord], sink: &Sender<Chunk>) -> Result<bool> {
        let mut failures: Vec<String> = Vec::new();
        let mut remaining = reqs.iter().any(|r| !r.found);

        for t in &self.novel {
            if !remaining {
                break;
            }
            let result = match t {
                NovelTable::Pending(mt) => mt.get_many(reqs, sink),
                NovelTable::Persisted(cs) => cs.get_many(reqs, sink),
            };
            match result {
                Ok(rem) => remaining = rem,
                Err(e) => failures.push(e.to_string()),
            }
        }
        for cs in &self.upstream {
            if !remaining {
                break;
            }
            match cs.get_many(reqs, sink) {
                Ok(rem) => remaining = rem,
                Err(e) => failures.push(e.to_string()),
            }
        }

        if !failures.is_empty() {
            return Err(Error::Fetch(failures.join("; ")));
        }
        Ok(remaining)
    }

    pub fn has_many(&self, reqs: &mut [HasRecord]) -> Result<bool> {
        let mut remaining = reqs.iter().any(|r| !r.has);
        for t in &self.novel {
            if !remaining {
                break;
            }
            remaining = match t {
                NovelTable::Pending(mt) => mt.has_many(reqs),
                NovelTable::Persisted(cs) => cs.has_many(reqs)?,
            };
        }
        for cs in &self.upstream {
            if !remaining {
                break;
            }
            remaining = cs.has_many(reqs)?;
        }
        Ok(remaining)
    }

    /// Estimates physical reads across the stack. Chunks still buffered in
    /// pending tables cost no physical reads.
    pub fn calc_reads(&self, reqs: &mut [GetRecord], block_size: u64) -> Result<(usize, bool, bool)> {
        let mut reads = 0;
        let mut split = false;
        let mut remaining = reqs.iter().any(|r| !r.found);

        for t in &self.novel {
            if !remaining {
                break;
            }
            match t {
                NovelTable::Pending(mt) => {
                    for req in reqs.iter_mut() {
                        if !req.found && mt.has(&req.addr) {
                            req.found = true;
                        }
                    }
                    remaining = reqs.iter().any(|r| !r.found);
                }
                NovelTable::Persisted(cs) => {
                    let (r, s, rem) = cs.calc_reads(reqs, block_size)?;
                    reads += r;
                    split |= s;
                    remaining = rem;
                }
            }
        }
        for cs in &self.upstream {
            if !remaining {
                break;
            }
            let (r, s, rem) = cs.calc_reads(reqs, block_size)?;
            reads += r;
            split |= s;
            remaining = rem;
        }
        Ok((reads, split, remaining))
    }

    /// Forces any deferred serialization and returns the manifest-ready
    /// spec list, novel tables first.
    pub fn to_specs(&mut self, stats: &Arc<Stats>) -> Result<Vec<TableSpec>> {
        // Persist pending memtables oldest-first, each deduplicated
        // against the tables already in the set, so younger duplicates
        // collapse into the tables their elders become.
        for i in (0..self.novel.len()).rev() {
            let persisted = match &self.novel[i] {
                NovelTable::Persisted(_) => continue,
                NovelTable::Pending(mt) => {
                    let mut haves: Vec<Arc<dyn ChunkSource>> =
                        self.upstream.iter().cloned().collect();
                    for (j, t) in self.novel.iter().enumerate() {
                        if j != i {
                            if let NovelTable::Persisted(cs) = t {
                                haves.push(cs.clone());
                            }
                        }
                    }
                    self.p.persist(mt, &haves, stats)?
                }
            };
            match persisted {
                Some(cs) => self.novel[i] = NovelTable::Persisted(cs),
                // Every chunk was a duplicate; the table evaporates.
                None => {
                    self.novel.remove(i);
                }
            }
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::new();
        for cs in self.sources() {
            if cs.count() > 0 && seen.insert(cs.name()) {
                specs.push(TableSpec {
                    name: cs.name(),
                    chunk_count: cs.count(),
                });
            }
        }
        Ok(specs)
    }

    /// Reconciles the upstream layer against a freshly observed manifest
    /// spec list, reusing already-open tables by name and keeping novel
    /// tables the manifest has not absorbed.
    pub fn rebase(&self, specs: &[TableSpec], stats: &Arc<Stats>) -> Result<TableSet> {
        let mut open: HashMap<Addr, Arc<dyn ChunkSource>> = HashMap::new();
        for cs in self.sources() {
            open.insert(cs.name(), cs.clone());
        }

        let mut upstream = Vec::with_capacity(specs.len());
        for spec in specs {
            let cs = match open.get(&spec.name) {
                Some(cs) => cs.clone(),
                None => self.p.open(spec.name, spec.chunk_count, stats)?,
            };
            upstream.push(cs);
        }

        let upstream_names: HashSet<Addr> = specs.iter().map(|s| s.name).collect();
        let novel = self
            .novel
            .iter()
            .filter(|t| match t {
                NovelTable::Pending(_) => true,
                NovelTable::Persisted(cs) => !upstream_names.contains(&cs.name()),
            })
            .cloned()
            .collect();

        Ok(TableSet {
            novel,
            upstream,
            p: self.p.clone(),
        })
    }

    /// After a successful commit, merges the (now manifest-named) novel
    /// tables into the upstream layer.
    pub fn flatten(&self) -> TableSet {
        let mut seen = HashSet::new();
        let mut upstream = Vec::new();
        let mut novel = Vec::new();

        for t in &self.novel {
            match t {
                NovelTable::Pending(mt) => novel.push(NovelTable::Pending(mt.clone())),
                NovelTable::Persisted(cs) => {
                    if cs.count() > 0 && seen.insert(cs.name()) {
                        upstream.push(cs.clone());
                    }
                }
            }
        }
        for cs in &self.upstream {
            if seen.insert(cs.name()) {
                upstream.push(cs.clone());
            }
        }

        TableSet {
            novel,
            upstream,
            p: self.p.clone(),
        }
    }
}
