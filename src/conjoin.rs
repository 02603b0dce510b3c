use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;

use crate::error::Result;
use crate::hash::Addr;
use crate::manifest::{generate_lock_hash, ManifestContents, ManifestManager, TableSpec};
use crate::persist::TablePersister;
use crate::stats::Stats;
use crate::table::ChunkSource;
use crate::tableset::TableSet;

/// Policy and mechanism for merging many small upstream tables into one.
/// Runs inline inside the commit lock; the merge is published through the
/// same optimistic manifest protocol as a commit, with the root unchanged.
pub struct InlineConjoiner {
    max_tables: usize,
}

impl InlineConjoiner {
    pub fn new(max_tables: usize) -> InlineConjoiner {
        InlineConjoiner { max_tables }
    }

    /// Fires once the upstream table count crosses the threshold.
    pub fn conjoin_required(&self, ts: &TableSet) -> bool {
        ts.upstream_count() > self.max_tables
    }

    /// Merges the chosen run of smallest upstream tables into one and
    /// CAS-publishes a manifest in which the merged table replaces them.
    /// Retries while every conjoinee survives in the winning manifest;
    /// if a concurrent writer absorbed them first, its contents win.
    pub fn conjoin(
        &self,
        upstream: &ManifestContents,
        mm: &ManifestManager,
        p: &dyn TablePersister,
        stats: &Arc<Stats>,
    ) -> Result<ManifestContents> {
        let mut upstream = upstream.clone();
        let (to_merge, mut keepers) = choose_conjoinees(&upstream.specs);

        let sources: Vec<Arc<dyn ChunkSource>> = to_merge
            .iter()
            .map(|s| p.open(s.name, s.chunk_count, stats))
            .collect::<Result<_>>()?;
        let merged = p.conjoin_all(&sources, stats)?;
        let merged_spec = TableSpec {
            name: merged.name(),
            chunk_count: merged.count(),
        };
        let conjoinees: HashSet<Addr> = to_merge.iter().map(|s| s.name).collect();

        loop {
            let mut specs = Vec::with_capacity(keepers.len() + 1);
            specs.push(merged_spec);
            specs.extend(keepers.iter().cloned());

            let contents = ManifestContents {
                vers: upstream.vers.clone(),
                root: upstream.root,
                lock: generate_lock_hash(&upstream.root, &specs),
                specs,
            };

            let winner = mm.update(upstream.lock, contents.clone(), stats)?;
            if winner.lock == contents.lock {
                stats.record_conjoin();
                tracing::info!(
                    merged = %merged_spec.name,
                    inputs = conjoinees.len(),
                    tables = contents.specs.len(),
                    "conjoined upstream tables"
                );
                return Ok(contents);
            }

            if conjoinees
                .iter()
                .all(|name| winner.specs.iter().any(|s| s.name == *name))
            {
                // Every conjoinee survives in the winning manifest, so the
                // merged table is still an exact replacement; retry on top
                // of the winner.
                tracing::debug!(manifest = mm.name(), "conjoin lost manifest race, retrying");
                keepers = winner
                    .specs
                    .iter()
                    .filter(|s| !conjoinees.contains(&s.name))
                    .cloned()
                    .collect();
                upstream = winner;
                continue;
            }

            // A concurrent writer already replaced some conjoinee; its
            // manifest supersedes our merge.
            tracing::debug!(manifest = mm.name(), "conjoin superseded by concurrent writer");
            return Ok(winner);
        }
    }
}

/// Splits the spec list into the run of smallest tables to merge and the
/// tables to keep. Starting from the two smallest (by chunk count), the run
/// keeps absorbing the next-smallest table while the accumulated count
/// exceeds it, which keeps surviving table sizes roughly geometric. Keepers
/// preserve their original manifest order.
fn choose_conjoinees(specs: &[TableSpec]) -> (Vec<TableSpec>, Vec<TableSpec>) {
    if specs.len() < 2 {
        return (Vec::new(), specs.to_vec());
    }

    let sorted: Vec<&TableSpec> = specs
        .iter()
        .sorted_by_key(|s| (s.chunk_count, s.name))
        .collect();

    let mut sum = sorted[0].chunk_count as u64 + sorted[1].chunk_count as u64;
    let mut take = 2;
    while take < sorted.len() && sum > sorted[take].chunk_count as u64 {
        sum += sorted[take].chunk_count as u64;
        take += 1;
    }

    let merge_names: HashSet<Addr> = sorted[..take].iter().map(|s| s.name).collect();
    let to_merge: Vec<TableSpec> = specs
        .iter()
        .filter(|s| merge_names.contains(&s.name))
        .cloned()
        .collect();
    let keepers: Vec<TableSpec> = specs
        .iter()
        .filter(|s| !merge_names.contains(&s.name))
        .cloned()
        .collect();
    (to_merge, keepers)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::manifest::blob::BlobManifest;
    use crate::manifest::{ManifestCache, ManifestLocks};
    use crate::memtable::MemTable;
    use crate::persist::{BlobstorePersister, Blobstore, MemoryBlobstore, NoHaves};
    use crate::runtime::IndexCache;

    fn spec(name: &[u8], count: u32) -> TableSpec {
        TableSpec {
            name: Addr::of(name),
            chunk_count: count,
        }
    }

    #[test]
    fn test_choose_smallest_run() {
        let specs = vec![spec(b"big", 8), spec(b"a", 1), spec(b"b", 1), spec(b"c", 1)];
        let (to_merge, keepers) = choose_conjoinees(&specs);

        assert_eq!(to_merge.len(), 3);
        assert!(to_merge.iter().all(|s| s.chunk_count == 1));
        assert_eq!(keepers, vec![spec(b"big", 8)]);
    }

    #[test]
    fn test_choose_stops_at_larger_table() {
        let specs = vec![spec(b"a", 1), spec(b"b", 1), spec(b"huge", 100)];
        let (to_merge, keepers) = choose_conjoinees(&specs);

        assert_eq!(to_merge.len(), 2);
        assert_eq!(keepers, vec![spec(b"huge", 100)]);
    }

    #[test]
    fn test_choose_absorbs_geometric_run() {
        // 2 + 2 = 4 > 3, then 7 > 6, then 13 <= 100.
        let specs = vec![
            spec(b"a", 2),
            spec(b"b", 2),
            spec(b"c", 3),
            spec(b"d", 6),
            spec(b"e", 100),
        ];
        let (to_merge, keepers) = choose_conjoinees(&specs);
        assert_eq!(to_merge.len(), 4);
        assert_eq!(keepers, vec![spec(b"e", 100)]);
    }

    struct Fixture {
        mm: ManifestManager,
        p: BlobstorePersister,
        stats: Arc<Stats>,
    }

    fn fixture() -> Fixture {
        let bs: Arc<dyn Blobstore> = Arc::new(MemoryBlobstore::new());
        let mm = ManifestManager::new(
            Arc::new(BlobManifest::new(bs.clone(), "test/conjoin")),
            Arc::new(ManifestCache::new(1 << 20)),
            Arc::new(ManifestLocks::new()),
        );
        let p = BlobstorePersister::new(bs, Arc::new(IndexCache::new(1 << 20)));
        Fixture {
            mm,
            p,
            stats: Arc::new(Stats::new()),
        }
    }

    /// Persists one single-chunk table and returns its spec.
    fn one_chunk_table(f: &Fixture, payload: &[u8]) -> TableSpec {
        let mut mt = MemTable::new(1 << 20);
        assert!(mt.add_chunk(Addr::of(payload), payload.to_vec()));
        let cs = f.p.persist(&mt, &NoHaves, &f.stats).unwrap().unwrap();
        TableSpec {
            name: cs.name(),
            chunk_count: cs.count(),
        }
    }

    fn manifest_with(f: &Fixture, root: &[u8], specs: Vec<TableSpec>) -> ManifestContents {
        let root = Addr::of(root);
        let contents = ManifestContents {
            vers: "5".to_string(),
            lock: generate_lock_hash(&root, &specs),
            root,
            specs,
        };
        let prev = f
            .mm
            .fetch(&f.stats)
            .unwrap()
            .map(|c| c.lock)
            .unwrap_or_default();
        let winner = f.mm.update(prev, contents.clone(), &f.stats).unwrap();
        assert_eq!(winner, contents);
        contents
    }

    #[test]
    fn test_conjoin_preserves_chunks() -> Result<()> {
        let f = fixture();
        let conjoiner = InlineConjoiner::new(2);

        let payloads: Vec<Vec<u8>> = (0..5).map(|i| format!("cj {i}").into_bytes()).collect();
        let specs: Vec<TableSpec> = payloads.iter().map(|p| one_chunk_table(&f, p)).collect();
        let upstream = manifest_with(&f, b"root", specs);

        let after = conjoiner.conjoin(&upstream, &f.mm, &f.p, &f.stats)?;
        assert!(after.specs.len() < upstream.specs.len());
        assert_eq!(after.root, upstream.root);
        assert_eq!(after.lock, generate_lock_hash(&after.root, &after.specs));

        // Every chunk is still reachable through the new spec set.
        for payload in &payloads {
            let addr = Addr::of(payload);
            let found = after.specs.iter().any(|s| {
                let cs = f.p.open(s.name, s.chunk_count, &f.stats).unwrap();
                cs.get(&addr).unwrap().as_deref() == Some(payload.as_slice())
            });
            assert!(found, "chunk lost by conjoin");
        }

        // The durable manifest agrees.
        assert_eq!(f.mm.fetch(&f.stats)?, Some(after));
        Ok(())
    }

    #[test]
    fn test_conjoin_retries_past_compatible_race() -> Result<()> {
        let f = fixture();
        let conjoiner = InlineConjoiner::new(2);

        let payloads: Vec<Vec<u8>> = (0..4).map(|i| format!("race {i}").into_bytes()).collect();
        let specs: Vec<TableSpec> = payloads.iter().map(|p| one_chunk_table(&f, p)).collect();
        let stale = manifest_with(&f, b"root", specs.clone());

        // Another writer appends a table before our CAS lands; our view of
        // the manifest is now stale but every conjoinee survives.
        let extra = one_chunk_table(&f, b"race extra");
        let mut grown = specs.clone();
        grown.push(extra);
        let current = ManifestContents {
            vers: "5".to_string(),
            lock: generate_lock_hash(&stale.root, &grown),
            root: stale.root,
            specs: grown,
        };
        f.mm.update(stale.lock, current.clone(), &f.stats)?;

        let after = conjoiner.conjoin(&stale, &f.mm, &f.p, &f.stats)?;
        assert_eq!(after.root, stale.root);
        assert!(
            after.specs.iter().any(|s| s.name == extra.name),
            "the concurrently added table must survive the conjoin"
        );
        assert!(after.specs.len() < current.specs.len());
        Ok(())
    }
}
