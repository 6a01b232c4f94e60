use std::io;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use filetime::FileTime;
use keel_cache::{CachingFileHasher, CrossBuildCache, FileTimeStampInspector, InMemoryStore};
use keel_core::{system_time_millis, DefaultFileHasher, FileHasher, FileMetadata, HashCode};

#[derive(Default)]
struct CountingHasher(AtomicUsize);

impl FileHasher for CountingHasher {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> io::Result<HashCode> {
        self.0.fetch_add(1, Ordering::SeqCst);
        DefaultFileHasher.hash(path, metadata)
    }
}

fn metadata(path: &Path) -> FileMetadata {
    let meta = std::fs::metadata(path).unwrap();
    FileMetadata {
        length: meta.len(),
        last_modified: system_time_millis(meta.modified().unwrap()),
    }
}

#[test]
fn files_touched_to_the_boundary_are_rehashed_and_purged() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("build-marker");
    let inspector = Arc::new(FileTimeStampInspector::new(&marker));
    inspector.build_finished(|_| {}).unwrap();
    let boundary = FileTime::from_last_modification_time(&std::fs::metadata(&marker).unwrap());

    let counting = Arc::new(CountingHasher::default());
    let hasher = CachingFileHasher::new(
        counting.clone(),
        CrossBuildCache::new(
            "files",
            Arc::new(InMemoryStore::new()),
            NonZeroUsize::new(64).unwrap(),
        ),
        Some(Arc::clone(&inspector)),
    );

    let file = dir.path().join("input.txt");
    std::fs::write(&file, b"content").unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_000_000, 0)).unwrap();

    hasher.hash(&file, metadata(&file)).unwrap();
    hasher.hash(&file, metadata(&file)).unwrap();
    assert_eq!(counting.0.load(Ordering::SeqCst), 1);

    filetime::set_file_mtime(&file, boundary).unwrap();
    hasher.hash(&file, metadata(&file)).unwrap();
    hasher.hash(&file, metadata(&file)).unwrap();
    assert_eq!(counting.0.load(Ordering::SeqCst), 3);
    assert_eq!(hasher.statistics().ambiguous, 1);
    assert!(hasher.cached(&file).is_some());

    hasher.build_finished().unwrap();
    assert!(hasher.cached(&file).is_none());
}

#[test]
fn files_moved_off_the_boundary_keep_their_entry() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("build-marker");
    let inspector = Arc::new(FileTimeStampInspector::new(&marker));
    inspector.build_finished(|_| {}).unwrap();
    let boundary = FileTime::from_last_modification_time(&std::fs::metadata(&marker).unwrap());

    let hasher = CachingFileHasher::new(
        Arc::new(DefaultFileHasher),
        CrossBuildCache::new(
            "files",
            Arc::new(InMemoryStore::new()),
            NonZeroUsize::new(64).unwrap(),
        ),
        Some(Arc::clone(&inspector)),
    );
    let file = dir.path().join("input.txt");
    std::fs::write(&file, b"content").unwrap();
    filetime::set_file_mtime(&file, boundary).unwrap();
    hasher.hash(&file, metadata(&file)).unwrap();

    // Edited again later in the build: the stale ambiguity no longer applies.
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_000_000, 0)).unwrap();
    hasher.hash(&file, metadata(&file)).unwrap();

    hasher.build_finished().unwrap();
    assert!(hasher.cached(&file).is_some());
}
