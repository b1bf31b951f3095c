//! Document and process-level locks.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::StoreError;

/// In-process mutual exclusion keyed by document path.
#[derive(Debug, Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `path`.
    pub fn with<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        let _guard = lock.lock();
        f()
    }
}

/// Cross-process exclusive lock on `<path>.lock`, released on drop.
#[derive(Debug)]
pub struct FileLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
    path: PathBuf,
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StoreError::io(path, e))
}

impl FileLock {
    /// Block until the lock for `target` is held.
    pub fn acquire(target: &Path) -> Result<Self, StoreError> {
        let path = lock_path(target);
        let file = open_lock_file(&path)?;
        #[cfg(unix)]
        {
            use nix::fcntl::{flock, FlockArg};
            use std::os::fd::AsRawFd;
            flock(file.as_raw_fd(), FlockArg::LockExclusive)
                .map_err(|e| StoreError::io(&path, e.into()))?;
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::fcntl::{flock, FlockArg};
            use std::os::fd::AsRawFd;
            let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        }
    }
}

/// Guard against a second coordinator on the same runtime directory.
///
/// Holds a non-blocking exclusive lock on the lock file for the lifetime of
/// the process and records the owner's pid in it.
#[derive(Debug)]
pub struct InstanceLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to take the lock. `Ok(None)` means another instance holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StoreError> {
        let mut file = open_lock_file(path)?;
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::fcntl::{flock, FlockArg};
            use std::os::fd::AsRawFd;
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {}
                Err(Errno::EWOULDBLOCK) => return Ok(None),
                Err(e) => return Err(StoreError::io(path, e.into())),
            }
        }
        file.set_len(0).map_err(|e| StoreError::io(path, e))?;
        write!(file, "{}", std::process::id()).map_err(|e| StoreError::io(path, e))?;
        file.flush().map_err(|e| StoreError::io(path, e))?;
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn document_locks_serialize_same_path() {
        let locks = Arc::new(DocumentLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let path = PathBuf::from("/tmp/doc.json");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let path = path.clone();
                std::thread::spawn(move || {
                    locks.with(&path, || {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn file_lock_uses_sidecar() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("alice.json");
        let lock = FileLock::acquire(&target).unwrap();
        assert_eq!(lock.path(), dir.path().join("alice.json.lock"));
        assert!(lock.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn second_instance_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runtime").join("main.lock");
        let first = InstanceLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());

        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());
        drop(first);
        assert!(InstanceLock::try_acquire(&path).unwrap().is_some());
    }
}
