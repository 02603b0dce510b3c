use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{format_line, parse_line, Manifest, ManifestContents};
use crate::errdata;
use crate::error::Result;
use crate::flock::FileLock;
use crate::hash::Addr;
use crate::stats::Stats;

pub const MANIFEST_FILE: &str = "manifest";
const LOCK_FILE: &str = "lock";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The manifest record of a directory-backed store: a `manifest` file next
/// to the table files. Mutual exclusion across processes is an exclusive
/// flock on a sibling `lock` file; the record itself is replaced atomically
/// by writing a temp file and renaming it over the old one.
pub struct FileManifest {
    dir: PathBuf,
    name: String,
}

impl FileManifest {
    pub fn new(dir: impl Into<PathBuf>) -> FileManifest {
        let dir = dir.into();
        let name = dir.to_string_lossy().into_owned();
        FileManifest { dir, name }
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    fn read_contents(&self) -> Result<Option<ManifestContents>> {
        let mut file = match File::open(self.manifest_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut line = String::new();
        file.read_to_string(&mut line)?;
        parse_line(&line).map(Some)
    }

    fn write_contents(&self, contents: &ManifestContents) -> Result<()> {
        let temp_path = self.temp_path();
        let mut temp = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        temp.write_all(format_line(contents).as_bytes())?;
        temp.sync_all()?;
        drop(temp);
        fs::rename(&temp_path, self.manifest_path())?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".manifest-{}-{n}", std::process::id()))
    }
}

impl Manifest for FileManifest {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, stats: &Stats) -> Result<Option<ManifestContents>> {
        stats.record_manifest_fetch();
        let _flock = FileLock::lock(self.lock_path())?;
        self.read_contents()
    }

    fn update(
        &self,
        prev_lock: Addr,
        new: ManifestContents,
        stats: &Stats,
    ) -> Result<ManifestContents> {
        stats.record_manifest_update();
        let _flock = FileLock::lock(self.lock_path())?;

        let current = self
            .read_contents()?
            .unwrap_or_else(|| ManifestContents::empty(new.vers.clone()));
        if current.lock != prev_lock {
            // Lost the race; hand back the winner for reconciliation.
            return Ok(current);
        }

        self.write_contents(&new)?;
        Ok(new)
    }
}

/// Verifies that the store directory exists and is a directory.
pub fn check_dir(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir)?;
    if !meta.is_dir() {
        return errdata!("path is not a directory: {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::super::{generate_lock_hash, TableSpec};
    use super::*;

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
    fn test_fetch_missing_manifest() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let m = FileManifest::new(dir.path());
        assert_eq!(m.fetch(&Stats::new())?, None);
        Ok(())
    }

    #[test]
    fn test_update_then_fetch() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let stats = Stats::new();
        let m = FileManifest::new(dir.path());

        let c1 = contents(b"r1", vec![]);
        let winner = m.update(Addr::default(), c1.clone(), &stats)?;
        assert_eq!(winner, c1);
        assert_eq!(m.fetch(&stats)?, Some(c1));
        Ok(())
    }

    #[test]
    fn test_update_with_stale_lock_returns_current() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let stats = Stats::new();
        let m = FileManifest::new(dir.path());

        let c1 = contents(b"r1", vec![]);
        m.update(Addr::default(), c1.clone(), &stats)?;

        // A second writer that still believes the manifest is empty loses.
        let c2 = contents(b"r2", vec![]);
        let winner = m.update(Addr::default(), c2, &stats)?;
        assert_eq!(winner, c1);
        assert_eq!(m.fetch(&stats)?, Some(c1));
        Ok(())
    }

    #[test]
    fn test_update_chain() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let stats = Stats::new();
        let m = FileManifest::new(dir.path());

        let c1 = contents(b"r1", vec![]);
        m.update(Addr::default(), c1.clone(), &stats)?;

        let c2 = contents(
            b"r2",
            vec![TableSpec {
                name: Addr::of(b"table"),
                chunk_count: 7,
            }],
        );
        let winner = m.update(c1.lock, c2.clone(), &stats)?;
        assert_eq!(winner, c2);

        // A second handle to the same directory observes the final state.
        let m2 = FileManifest::new(dir.path());
        assert_eq!(m2.fetch(&stats)?, Some(c2));
        Ok(())
    }

    #[test]
    fn test_check_dir() {
        let dir = TempDir::new().unwrap();
        assert!(check_dir(dir.path()).is_ok());
        assert!(check_dir(&dir.path().join("missing")).is_err());

        let file_path = dir.path().join("afile");
        std::fs::write(&file_path, b"x").unwrap();
        assert!(check_dir(&file_path).is_err());
    }
}
