use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt as _;

use crate::error::CacheError;

/// Exclusive advisory lock on a store directory's lock file, released on drop.
///
/// Every acquisition opens its own handle, so threads of one process exclude
/// each other the same way separate processes do.
pub(crate) struct DirLock(File);

impl DirLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self, CacheError> {
        let lock_err = |source| CacheError::Lock {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        Ok(Self(file))
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}
