use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An advisory exclusive lock on a file, released on drop. The lock file
/// contains the process ID for debugging purposes.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock, blocking until it is available.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::acquire(path, true)
    }

    /// Acquires the lock or fails immediately if another holder has it.
    pub fn try_lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::acquire(path, false)
    }

    fn acquire<P: AsRef<Path>>(path: P, block: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::os_lock(&file, block)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn os_lock(file: &File, block: bool) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let flags = if block { LOCK_EX } else { LOCK_EX | LOCK_NB };
        let result = unsafe { flock(fd, flags) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn os_lock(_file: &File, _block: bool) -> io::Result<()> {
        // Fallback for other platforms - just succeed.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself is left in place to avoid unlink races with other
        // processes opening it concurrently.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("store.lock");

        let lock = FileLock::lock(&lock_path).expect("failed to acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());

        let content = std::fs::read_to_string(&lock_path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("store.lock");

        let _held = FileLock::lock(&lock_path).expect("failed to acquire first lock");
        assert!(FileLock::try_lock(&lock_path).is_err());
    }

    #[test]
    fn test_relock_after_drop() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("store.lock");

        {
            let _lock = FileLock::lock(&lock_path).expect("failed to acquire lock");
        }

        let _again = FileLock::try_lock(&lock_path).expect("lock should be free after drop");
    }
}
