use std::sync::Arc;

use super::{format_line, parse_line, Manifest, ManifestContents};
use crate::error::Result;
use crate::hash::Addr;
use crate::persist::{BlobRange, Blobstore, CheckAndPut};
use crate::stats::Stats;

const MANIFEST_KEY: &str = "manifest";

/// The manifest record of a blobstore-backed store, held in a single
/// mutable object. The compare-and-set rides the blobstore's generation
/// matching: read the object, verify the parsed lock, then conditionally
/// put against the generation the read observed.
pub struct BlobManifest {
    bs: Arc<dyn Blobstore>,
    name: String,
}

impl BlobManifest {
    /// `name` identifies the store for the in-process manifest cache and
    /// locks, e.g. a bucket/prefix pair. Handles that address the same
    /// underlying object must use the same name.
    pub fn new(bs: Arc<dyn Blobstore>, name: impl Into<String>) -> BlobManifest {
        BlobManifest {
            bs,
            name: name.into(),
        }
    }
}

impl Manifest for BlobManifest {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, stats: &Stats) -> Result<Option<ManifestContents>> {
        stats.record_manifest_fetch();
        match self.bs.get(MANIFEST_KEY, BlobRange::All)? {
            Some(got) => {
                let line = String::from_utf8(got.data)
                    .map_err(|e| crate::error::Error::InvalidData(e.to_string()))?;
                parse_line(&line).map(Some)
            }
            None => Ok(None),
        }
    }

    fn update(
        &self,
        prev_lock: Addr,
        new: ManifestContents,
        stats: &Stats,
    ) -> Result<ManifestContents> {
        stats.record_manifest_update();
        let line = format_line(&new);
        loop {
            let (current, generation) = match self.bs.get(MANIFEST_KEY, BlobRange::All)? {
                Some(got) => {
                    let text = String::from_utf8(got.data)
                        .map_err(|e| crate::error::Error::InvalidData(e.to_string()))?;
                    (parse_line(&text)?, Some(got.generation))
                }
                None => (ManifestContents::empty(new.vers.clone()), None),
            };
            if current.lock != prev_lock {
                // Lost the race; hand back the winner for reconciliation.
                return Ok(current);
            }
            match self.bs.check_and_put(generation, MANIFEST_KEY, line.as_bytes())? {
                CheckAndPut::Written(_) => return Ok(new),
                // The object moved between our read and the conditional
                // put; re-read and re-verify the lock.
                CheckAndPut::Conflict => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{generate_lock_hash, TableSpec};
    use super::*;
    use crate::persist::MemoryBlobstore;

    fn contents(root: &[u8], specs: Vec<TableSpec>) -> ManifestContents {
        let root = Addr::of(root);
        let lock = generate_lock_hash(&root, &specs);
        ManifestContents {
            vers: "5".to_string(),
            lock,
            root,
            specs,
        }
    }

    #[test]
    fn test_fetch_missing() -> Result<()> {
        let bs: Arc<dyn Blobstore> = Arc::new(MemoryBlobstore::new());
        let m = BlobManifest::new(bs, "bucket/path");
        assert_eq!(m.fetch(&Stats::new())?, None);
        Ok(())
    }

    #[test]
    fn test_update_and_fetch() -> Result<()> {
        let bs: Arc<dyn Blobstore> = Arc::new(MemoryBlobstore::new());
        let stats = Stats::new();
        let m = BlobManifest::new(bs, "bucket/path");

        let c1 = contents(b"r1", vec![]);
        assert_eq!(m.update(Addr::default(), c1.clone(), &stats)?, c1);
        assert_eq!(m.fetch(&stats)?, Some(c1.clone()));

        let c2 = contents(
            b"r2",
            vec![TableSpec {
                name: Addr::of(b"t"),
                chunk_count: 2,
            }],
        );
        assert_eq!(m.update(c1.lock, c2.clone(), &stats)?, c2);
        assert_eq!(m.fetch(&stats)?, Some(c2));
        Ok(())
    }

    #[test]
    fn test_stale_lock_loses() -> Result<()> {
        let bs: Arc<dyn Blobstore> = Arc::new(MemoryBlobstore::new());
        let stats = Stats::new();
        let m = BlobManifest::new(bs.clone(), "bucket/path");

        let c1 = contents(b"r1", vec![]);
        m.update(Addr::default(), c1.clone(), &stats)?;

        // A second handle with a stale view loses and sees the winner.
        let m2 = BlobManifest::new(bs, "bucket/path");
        let c2 = contents(b"r2", vec![]);
        assert_eq!(m2.update(Addr::default(), c2, &stats)?, c1);
        Ok(())
    }
}
