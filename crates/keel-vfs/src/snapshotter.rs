use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_core::{DirectoryTreeSnapshot, FileHasher, FileMetadata, FileKind, HashCode, Snapshot};

use crate::error::VfsError;
use crate::excludes::DefaultExcludes;
use crate::fs::{FileStat, FileSystem, StatKind};
use crate::guard::ProducerGuard;
use crate::mirror::FileSystemMirror;
use crate::patterns::PatternSet;

/// Counters describing the work the snapshotter actually performed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotterStatistics {
    pub stats: u64,
    pub directory_walks: u64,
    pub filtered_from_cache: u64,
    pub files_hashed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    stats: AtomicU64,
    directory_walks: AtomicU64,
    filtered_from_cache: AtomicU64,
    files_hashed: AtomicU64,
}

/// Produces [`Snapshot`]s and [`DirectoryTreeSnapshot`]s, memoized in a
/// [`FileSystemMirror`].
pub struct FileSystemSnapshotter {
    fs: Arc<dyn FileSystem>,
    hasher: Arc<dyn FileHasher>,
    mirror: Arc<FileSystemMirror>,
    default_excludes: DefaultExcludes,
    producers: ProducerGuard<Arc<str>>,
    counters: Counters,
}

impl FileSystemSnapshotter {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        hasher: Arc<dyn FileHasher>,
        mirror: Arc<FileSystemMirror>,
        default_excludes: DefaultExcludes,
    ) -> Self {
        Self {
            fs,
            hasher,
            mirror,
            default_excludes,
            producers: ProducerGuard::new(),
            counters: Counters::default(),
        }
    }

    pub fn mirror(&self) -> &Arc<FileSystemMirror> {
        &self.mirror
    }

    pub fn statistics(&self) -> SnapshotterStatistics {
        SnapshotterStatistics {
            stats: self.counters.stats.load(Ordering::Relaxed),
            directory_walks: self.counters.directory_walks.load(Ordering::Relaxed),
            filtered_from_cache: self.counters.filtered_from_cache.load(Ordering::Relaxed),
            files_hashed: self.counters.files_hashed.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of `path` itself. Directories are not walked.
    pub fn snapshot_self(&self, path: &Path) -> Result<Snapshot, VfsError> {
        let key = FileSystemMirror::path_key(path);
        if let Some(snapshot) = self.mirror.file(&key) {
            return Ok(snapshot);
        }
        self.producers.guard_by_key(&key, || {
            if let Some(snapshot) = self.mirror.file(&key) {
                return Ok(snapshot);
            }
            let snapshot = self.snapshot_uncached(Arc::clone(&key), path)?;
            self.mirror.put_file(snapshot.clone());
            Ok(snapshot)
        })
    }

    /// Snapshot of the tree rooted at `path`, restricted by `patterns`.
    ///
    /// Unfiltered results are cached in the mirror and shareable. A filtered
    /// request is answered by filtering the cached unfiltered tree when there
    /// is one, and by a fresh filtered walk otherwise; filtered trees are never
    /// cached nor shared.
    pub fn snapshot_directory_tree(
        &self,
        path: &Path,
        patterns: &PatternSet,
    ) -> Result<Arc<DirectoryTreeSnapshot>, VfsError> {
        let key = FileSystemMirror::path_key(path);
        if patterns.is_empty() {
            if let Some(tree) = self.mirror.directory_tree(&key) {
                return Ok(tree);
            }
            return self.producers.guard_by_key(&key, || {
                if let Some(tree) = self.mirror.directory_tree(&key) {
                    return Ok(tree);
                }
                let tree = Arc::new(self.walk(&key, path, patterns, true)?);
                self.mirror.put_directory_tree(Arc::clone(&tree));
                Ok(tree)
            });
        }

        if let Some(unfiltered) = self.mirror.directory_tree(&key) {
            self.counters.filtered_from_cache.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::new(filter_tree(&unfiltered, patterns)));
        }
        self.producers
            .guard_by_key(&key, || self.walk(&key, path, patterns, false))
            .map(Arc::new)
    }

    /// A single hash summarizing everything at `path`: the file content for a
    /// file, the aggregate of the whole tree for a directory.
    pub fn snapshot_all(&self, path: &Path) -> Result<HashCode, VfsError> {
        let key = FileSystemMirror::path_key(path);
        if let Some(hash) = self.mirror.content(&key) {
            return Ok(hash);
        }
        let root = self.snapshot_self(path)?;
        let hash = match root.kind() {
            FileKind::Directory => self
                .snapshot_directory_tree(path, &PatternSet::all())?
                .aggregate_hash(),
            FileKind::RegularFile | FileKind::Missing => root.content_hash(),
        };
        self.mirror.put_content(key, hash);
        Ok(hash)
    }

    fn stat(&self, path: &Path) -> Result<FileStat, VfsError> {
        self.counters.stats.fetch_add(1, Ordering::Relaxed);
        self.fs
            .stat(path)
            .map_err(|err| VfsError::io("stat", path, err))
    }

    fn snapshot_uncached(&self, key: Arc<str>, path: &Path) -> Result<Snapshot, VfsError> {
        let stat = self.stat(path)?;
        self.snapshot_from_stat(key, path, stat)
    }

    fn snapshot_from_stat(
        &self,
        key: Arc<str>,
        path: &Path,
        stat: FileStat,
    ) -> Result<Snapshot, VfsError> {
        match stat.kind {
            StatKind::Missing => Ok(Snapshot::missing(key)),
            StatKind::Directory => Ok(Snapshot::directory(key)),
            StatKind::RegularFile => {
                let metadata = FileMetadata {
                    length: stat.length,
                    last_modified: stat.last_modified,
                };
                self.counters.files_hashed.fetch_add(1, Ordering::Relaxed);
                let hash = self
                    .hasher
                    .hash(path, metadata)
                    .map_err(|err| VfsError::io("hash", path, err))?;
                Ok(Snapshot::regular_file(key, hash, metadata))
            }
            StatKind::Other => Err(VfsError::UnrecognizedFileType {
                path: path.to_path_buf(),
            }),
        }
    }

    fn walk(
        &self,
        key: &Arc<str>,
        path: &Path,
        patterns: &PatternSet,
        shareable: bool,
    ) -> Result<DirectoryTreeSnapshot, VfsError> {
        let root = match self.mirror.file(key) {
            Some(root) => root,
            None => self.snapshot_uncached(Arc::clone(key), path)?,
        };
        let mut descendants = Vec::new();
        if root.kind() == FileKind::Directory {
            self.counters.directory_walks.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(target = "keel.vfs", path = %path.display(), "walking directory tree");
            self.walk_children(path, "", patterns, &mut descendants)?;
        }
        Ok(DirectoryTreeSnapshot::new(root, descendants, shareable))
    }

    fn walk_children(
        &self,
        dir: &Path,
        relative_dir: &str,
        patterns: &PatternSet,
        out: &mut Vec<Snapshot>,
    ) -> Result<(), VfsError> {
        let children = self
            .fs
            .read_dir(dir)
            .map_err(|err| VfsError::io("list", dir, err))?;
        for child in children {
            let Some(name) = child.file_name().map(|name| name.to_string_lossy().into_owned())
            else {
                continue;
            };
            let relative = if relative_dir.is_empty() {
                name.clone()
            } else {
                format!("{relative_dir}/{name}")
            };
            let stat = self.stat(&child)?;
            match stat.kind {
                StatKind::Directory => {
                    if self.default_excludes.excludes_directory(&name)
                        || !patterns.accepts_directory(&relative)
                    {
                        continue;
                    }
                    out.push(Snapshot::directory(FileSystemMirror::path_key(&child)));
                    self.walk_children(&child, &relative, patterns, out)?;
                }
                StatKind::RegularFile => {
                    if self.default_excludes.excludes_file(&name) || !patterns.accepts_file(&relative) {
                        continue;
                    }
                    let key = FileSystemMirror::path_key(&child);
                    out.push(self.snapshot_from_stat(key, &child, stat)?);
                }
                // Deleted between listing and stat.
                StatKind::Missing => continue,
                StatKind::Other => {
                    return Err(VfsError::UnrecognizedFileType { path: child });
                }
            }
        }
        Ok(())
    }
}

/// Applies `patterns` to a cached unfiltered tree without touching the disk.
///
/// Uses the same accept rules as the filtered walk, so a directory rejected by
/// the patterns drops its whole (contiguous, pre-order) subtree.
fn filter_tree(tree: &DirectoryTreeSnapshot, patterns: &PatternSet) -> DirectoryTreeSnapshot {
    let root = tree.root_path();
    let mut pruned: Option<String> = None;
    let mut descendants = Vec::new();
    for entry in tree.descendants() {
        if let Some(prefix) = &pruned {
            if entry.path().starts_with(prefix.as_str()) {
                continue;
            }
            pruned = None;
        }
        let relative = relative_path(root, entry.path());
        match entry.kind() {
            FileKind::Directory => {
                if patterns.accepts_directory(&relative) {
                    descendants.push(entry.clone());
                } else {
                    let mut prefix = entry.path().to_owned();
                    prefix.push(std::path::MAIN_SEPARATOR);
                    pruned = Some(prefix);
                }
            }
            FileKind::RegularFile | FileKind::Missing => {
                if patterns.accepts_file(&relative) {
                    descendants.push(entry.clone());
                }
            }
        }
    }
    DirectoryTreeSnapshot::new(tree.root().clone(), descendants, false)
}

fn relative_path(root: &str, path: &str) -> String {
    let rest = path.strip_prefix(root).unwrap_or(path);
    let rest = rest.trim_start_matches(['/', '\\']);
    if std::path::MAIN_SEPARATOR == '/' {
        rest.to_owned()
    } else {
        rest.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
