use std::path::PathBuf;
use std::sync::Arc;

use keel_core::{FileKind, Snapshot, SnapshotContent};
use keel_vfs::{FileSystemSnapshotter, PatternSet};

use crate::classpath::ClasspathHasher;
use crate::compare::{CompareStrategy, FingerprintEntries};
use crate::error::HashError;
use crate::fingerprint::{FileCollectionFingerprint, FingerprintRoot, FingerprintingStrategy};
use crate::normalization::{relative_path, NormalizedSnapshot, PathNormalization};

/// A set of files declared as a task input or output: root paths, plus
/// patterns restricting which files below directory roots are included.
#[derive(Clone, Debug, Default)]
pub struct FileCollection {
    roots: Vec<PathBuf>,
    patterns: PatternSet,
}

impl FileCollection {
    pub fn new<P: Into<PathBuf>>(roots: impl IntoIterator<Item = P>) -> Self {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            patterns: PatternSet::all(),
        }
    }

    pub fn with_patterns(mut self, patterns: PatternSet) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }
}

/// Turns file collections into [`FileCollectionFingerprint`]s.
#[derive(Clone)]
pub struct Fingerprinter {
    snapshotter: Arc<FileSystemSnapshotter>,
}

impl Fingerprinter {
    pub fn new(snapshotter: Arc<FileSystemSnapshotter>) -> Self {
        Self { snapshotter }
    }

    pub fn snapshotter(&self) -> &Arc<FileSystemSnapshotter> {
        &self.snapshotter
    }

    /// Snapshots every root: directories as trees, everything else as a
    /// single snapshot.
    pub fn snapshot_roots(&self, collection: &FileCollection) -> Result<Vec<FingerprintRoot>, HashError> {
        collection
            .roots
            .iter()
            .map(|path| {
                let root = self.snapshotter.snapshot_self(path)?;
                Ok(match root.kind() {
                    FileKind::Directory => FingerprintRoot::Tree(
                        self.snapshotter
                            .snapshot_directory_tree(path, &collection.patterns)?,
                    ),
                    FileKind::RegularFile | FileKind::Missing => FingerprintRoot::File(root),
                })
            })
            .collect()
    }

    pub fn fingerprint(
        &self,
        collection: &FileCollection,
        normalization: PathNormalization,
        compare: CompareStrategy,
    ) -> Result<FileCollectionFingerprint, HashError> {
        let roots = self.snapshot_roots(collection)?;
        Ok(FileCollectionFingerprint::from_roots(roots, normalization, compare))
    }

    /// Fingerprints a classpath. Order matters; archive and class file names
    /// below a root do, root file names do not. Missing roots and directories
    /// contribute nothing.
    pub fn fingerprint_classpath(
        &self,
        collection: &FileCollection,
        hasher: &ClasspathHasher,
    ) -> Result<FileCollectionFingerprint, HashError> {
        let mut entries = FingerprintEntries::default();
        for root in self.snapshot_roots(collection)? {
            match root {
                FingerprintRoot::File(snapshot) => {
                    if entries.contains_key(snapshot.path()) {
                        continue;
                    }
                    if let Some(hash) = hasher.hash_root_file(&snapshot)? {
                        let normalized = NormalizedSnapshot::ignored(with_content_hash(&snapshot, hash));
                        entries.insert(Arc::clone(snapshot.shared_path()), normalized);
                    }
                }
                FingerprintRoot::Tree(tree) => {
                    for snapshot in tree.descendants() {
                        if snapshot.kind() != FileKind::RegularFile
                            || entries.contains_key(snapshot.path())
                        {
                            continue;
                        }
                        let relative = relative_path(tree.root_path(), snapshot.path());
                        if let Some(hash) = hasher.hash_directory_entry(&relative, snapshot)? {
                            let normalized =
                                NormalizedSnapshot::new(&relative, with_content_hash(snapshot, hash));
                            entries.insert(Arc::clone(snapshot.shared_path()), normalized);
                        }
                    }
                }
            }
        }
        Ok(FileCollectionFingerprint::from_entries(
            FingerprintingStrategy::Classpath(hasher.mode()),
            CompareStrategy::Ordered,
            entries,
        ))
    }
}

fn with_content_hash(snapshot: &Snapshot, hash: keel_core::HashCode) -> Snapshot {
    match *snapshot.content() {
        SnapshotContent::RegularFile { metadata, .. } => {
            Snapshot::regular_file(Arc::clone(snapshot.shared_path()), hash, metadata)
        }
        _ => snapshot.clone(),
    }
}
