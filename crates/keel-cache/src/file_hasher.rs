use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_core::{FileHasher, FileMetadata, HashCode};
use keel_vfs::FileSystemMirror;
use serde::{Deserialize, Serialize};

use crate::cross_build::CrossBuildCache;
use crate::timestamps::FileTimeStampInspector;

/// What the file-level cache remembers about a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashEntry {
    pub hash: HashCode,
    pub length: u64,
    pub last_modified: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileHasherStatistics {
    pub files_hashed: u64,
    pub bytes_hashed: u64,
    pub cache_hits: u64,
    /// Lookups that had a matching entry but an ambiguous timestamp.
    pub ambiguous: u64,
}

#[derive(Default)]
struct Counters {
    files_hashed: AtomicU64,
    bytes_hashed: AtomicU64,
    cache_hits: AtomicU64,
    ambiguous: AtomicU64,
}

/// A [`FileHasher`] that remembers `(hash, length, mtime)` per path across
/// builds.
///
/// A cached hash is reused only when length and mtime match and, if an
/// inspector is configured, the mtime is not ambiguous.
pub struct CachingFileHasher {
    delegate: Arc<dyn FileHasher>,
    cache: CrossBuildCache<String, FileHashEntry>,
    inspector: Option<Arc<FileTimeStampInspector>>,
    counters: Counters,
}

impl CachingFileHasher {
    pub fn new(
        delegate: Arc<dyn FileHasher>,
        cache: CrossBuildCache<String, FileHashEntry>,
        inspector: Option<Arc<FileTimeStampInspector>>,
    ) -> Self {
        Self {
            delegate,
            cache,
            inspector,
            counters: Counters::default(),
        }
    }

    pub fn cached(&self, path: &Path) -> Option<FileHashEntry> {
        self.cache.get(&cache_key(path))
    }

    /// Forgets `path`, so its next lookup rehashes.
    pub fn discard(&self, path: &Path) {
        self.cache.remove(&cache_key(path));
    }

    pub fn build_started(&self) {
        if let Some(inspector) = &self.inspector {
            inspector.build_started();
        }
    }

    /// Ends the build for the timestamp inspector, purging entries whose
    /// mtime is still ambiguous.
    pub fn build_finished(&self) -> crate::Result<()> {
        match &self.inspector {
            Some(inspector) => inspector.build_finished(|path| self.discard(path)),
            None => Ok(()),
        }
    }

    pub fn statistics(&self) -> FileHasherStatistics {
        FileHasherStatistics {
            files_hashed: self.counters.files_hashed.load(Ordering::Relaxed),
            bytes_hashed: self.counters.bytes_hashed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            ambiguous: self.counters.ambiguous.load(Ordering::Relaxed),
        }
    }

    fn timestamp_can_be_trusted(&self, path: &Path, last_modified: u64) -> bool {
        self.inspector
            .as_ref()
            .map_or(true, |inspector| inspector.timestamp_can_be_trusted(path, last_modified))
    }
}

impl FileHasher for CachingFileHasher {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> io::Result<HashCode> {
        let key = cache_key(path);
        let trusted = self.timestamp_can_be_trusted(path, metadata.last_modified);
        if let Some(entry) = self.cache.get(&key) {
            if entry.length == metadata.length && entry.last_modified == metadata.last_modified {
                if trusted {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.hash);
                }
                self.counters.ambiguous.fetch_add(1, Ordering::Relaxed);
            }
        }

        let hash = self.delegate.hash(path, metadata)?;
        self.counters.files_hashed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_hashed
            .fetch_add(metadata.length, Ordering::Relaxed);
        self.cache.put(
            key,
            FileHashEntry {
                hash,
                length: metadata.length,
                last_modified: metadata.last_modified,
            },
        );
        Ok(hash)
    }
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Routes files under append-only roots to a global hasher and everything
/// else to the build-scoped one.
pub struct SplitFileHasher {
    mirror: Arc<FileSystemMirror>,
    global: Arc<dyn FileHasher>,
    build_scoped: Arc<dyn FileHasher>,
}

impl SplitFileHasher {
    pub fn new(
        mirror: Arc<FileSystemMirror>,
        global: Arc<dyn FileHasher>,
        build_scoped: Arc<dyn FileHasher>,
    ) -> Self {
        Self {
            mirror,
            global,
            build_scoped,
        }
    }
}

impl FileHasher for SplitFileHasher {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> io::Result<HashCode> {
        if self.mirror.is_append_only(&path.to_string_lossy()) {
            self.global.hash(path, metadata)
        } else {
            self.build_scoped.hash(path, metadata)
        }
    }
}
