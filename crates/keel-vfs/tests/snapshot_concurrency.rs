use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use keel_core::DefaultFileHasher;
use keel_vfs::{
    DefaultExcludes, FileStat, FileSystem, FileSystemMirror, FileSystemSnapshotter, LocalFs,
    PatternSet,
};

/// Wraps the local filesystem, counting calls and slowing them down enough
/// that concurrent callers overlap.
#[derive(Default)]
struct CountingFs {
    stats: AtomicUsize,
    listings: AtomicUsize,
}

impl FileSystem for CountingFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        LocalFs.stat(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        LocalFs.read_dir(path)
    }
}

fn snapshotter(fs: Arc<CountingFs>) -> Arc<FileSystemSnapshotter> {
    Arc::new(FileSystemSnapshotter::new(
        fs,
        Arc::new(DefaultFileHasher),
        Arc::new(FileSystemMirror::default()),
        DefaultExcludes::none(),
    ))
}

#[test]
fn concurrent_snapshots_of_one_path_stat_it_once() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("input.txt");
    std::fs::write(&file, b"shared").unwrap();

    let fs = Arc::new(CountingFs::default());
    let snapshotter = snapshotter(Arc::clone(&fs));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let snapshotter = Arc::clone(&snapshotter);
            let barrier = Arc::clone(&barrier);
            let file = file.clone();
            std::thread::spawn(move || {
                barrier.wait();
                snapshotter.snapshot_self(&file).unwrap()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(fs.stats.load(Ordering::SeqCst), 1);
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn concurrent_tree_requests_walk_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
    std::fs::write(dir.path().join("pkg/A.class"), b"a").unwrap();
    std::fs::write(dir.path().join("pkg/B.class"), b"b").unwrap();

    let fs = Arc::new(CountingFs::default());
    let snapshotter = snapshotter(Arc::clone(&fs));
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let snapshotter = Arc::clone(&snapshotter);
            let barrier = Arc::clone(&barrier);
            let root = dir.path().to_path_buf();
            std::thread::spawn(move || {
                barrier.wait();
                snapshotter
                    .snapshot_directory_tree(&root, &PatternSet::all())
                    .unwrap()
            })
        })
        .collect();

    let trees: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // Root and pkg are listed once each.
    assert_eq!(fs.listings.load(Ordering::SeqCst), 2);
    assert_eq!(snapshotter.statistics().directory_walks, 1);
    assert!(trees.iter().all(|tree| Arc::ptr_eq(tree, &trees[0])));
    assert_eq!(trees[0].descendants().len(), 3);
}

#[test]
fn distinct_paths_are_snapshotted_independently() {
    let dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(CountingFs::default());
    let snapshotter = snapshotter(Arc::clone(&fs));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let snapshotter = Arc::clone(&snapshotter);
            let path = dir.path().join(format!("missing-{i}"));
            std::thread::spawn(move || snapshotter.snapshot_self(&path).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(fs.stats.load(Ordering::SeqCst), 4);
}
