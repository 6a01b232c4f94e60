use std::sync::{Arc, OnceLock};

use keel_core::{DirectoryTreeSnapshot, FileKind, HashBuilder, HashCode, Snapshot};
use serde::{Deserialize, Serialize};

use crate::classpath::ClasspathMode;
use crate::compare::{Change, CompareStrategy, FingerprintEntries};
use crate::normalization::{NormalizedSnapshot, PathNormalization};

/// What produced the normalized entries of a fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FingerprintingStrategy {
    Path(PathNormalization),
    Classpath(ClasspathMode),
}

/// A root of a file collection, as snapshotted.
#[derive(Clone, Debug)]
pub enum FingerprintRoot {
    /// A regular file or missing path named directly.
    File(Snapshot),
    Tree(Arc<DirectoryTreeSnapshot>),
}

/// Normalized snapshots of a file collection, keyed by absolute path.
///
/// Fingerprints built from snapshot roots remember those roots (not
/// persisted) so shareable directory trees can be stored once by the task
/// history and referenced from many fingerprints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileCollectionFingerprint {
    strategy: FingerprintingStrategy,
    compare: CompareStrategy,
    entries: FingerprintEntries,
    #[serde(skip)]
    roots: Option<Arc<[FingerprintRoot]>>,
}

impl FileCollectionFingerprint {
    /// The canonical fingerprint of an empty collection.
    pub fn empty() -> &'static FileCollectionFingerprint {
        static EMPTY: OnceLock<FileCollectionFingerprint> = OnceLock::new();
        EMPTY.get_or_init(|| FileCollectionFingerprint {
            strategy: FingerprintingStrategy::Path(PathNormalization::Absolute),
            compare: CompareStrategy::Unordered,
            entries: FingerprintEntries::default(),
            roots: None,
        })
    }

    /// Normalizes `roots` in order. When the same absolute path is reached
    /// through several roots, the first occurrence wins.
    pub fn from_roots(
        roots: Vec<FingerprintRoot>,
        normalization: PathNormalization,
        compare: CompareStrategy,
    ) -> Self {
        let mut entries = FingerprintEntries::default();
        let mut insert = |normalized: Option<NormalizedSnapshot>| {
            if let Some(normalized) = normalized {
                entries
                    .entry(Arc::clone(normalized.absolute_path()))
                    .or_insert(normalized);
            }
        };
        for root in &roots {
            match root {
                FingerprintRoot::File(snapshot) => insert(normalization.normalize_root(snapshot)),
                FingerprintRoot::Tree(tree) => {
                    insert(normalization.normalize_root(tree.root()));
                    if tree.root().kind() == FileKind::Directory {
                        for descendant in tree.descendants() {
                            insert(normalization.normalize_descendant(tree.root_path(), descendant));
                        }
                    }
                }
            }
        }
        if entries.is_empty() {
            return Self::empty().clone();
        }
        Self {
            strategy: FingerprintingStrategy::Path(normalization),
            compare,
            entries,
            roots: Some(roots.into()),
        }
    }

    /// A fingerprint whose entries were normalized by the caller.
    pub fn from_entries(
        strategy: FingerprintingStrategy,
        compare: CompareStrategy,
        entries: FingerprintEntries,
    ) -> Self {
        if entries.is_empty() {
            return Self::empty().clone();
        }
        Self {
            strategy,
            compare,
            entries,
            roots: None,
        }
    }

    pub fn strategy(&self) -> FingerprintingStrategy {
        self.strategy
    }

    pub fn compare_strategy(&self) -> CompareStrategy {
        self.compare
    }

    pub fn entries(&self) -> &FingerprintEntries {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The snapshot roots, if this fingerprint was built from them in this
    /// process.
    pub fn roots(&self) -> Option<&[FingerprintRoot]> {
        self.roots.as_deref()
    }

    /// A hash of the whole fingerprint, suitable as a cache key.
    pub fn hash(&self) -> HashCode {
        let mut hasher = HashBuilder::new();
        if self.is_empty() {
            hasher.put_str("empty");
            return hasher.finish();
        }
        match self.strategy {
            FingerprintingStrategy::Path(normalization) => {
                hasher.put_str("path").put_str(&format!("{normalization:?}"));
            }
            FingerprintingStrategy::Classpath(mode) => {
                hasher.put_str("classpath").put_str(&format!("{mode:?}"));
            }
        }
        self.compare.append_to_hash(&mut hasher, self.entries.values());
        hasher.finish()
    }

    /// Visits changes from `previous` to `self` using this fingerprint's
    /// compare strategy. Returns `false` if the visitor stopped early.
    pub fn visit_changes(
        &self,
        previous: &FileCollectionFingerprint,
        title: &str,
        include_added: bool,
        visitor: &mut dyn FnMut(Change) -> bool,
    ) -> bool {
        let title: Arc<str> = Arc::from(title);
        self.compare
            .visit_changes(&self.entries, &previous.entries, &title, include_added, visitor)
    }

    /// All changes from `previous` to `self`.
    pub fn diff(&self, previous: &FileCollectionFingerprint, title: &str) -> Vec<Change> {
        let mut changes = Vec::new();
        self.visit_changes(previous, title, true, &mut |change| {
            changes.push(change);
            true
        });
        changes
    }
}

/// Equal when strategy, compare strategy and entries (in order) match.
impl PartialEq for FileCollectionFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.strategy == other.strategy
            && self.compare == other.compare
            && self.entries.len() == other.entries.len()
            && self.entries.iter().eq(other.entries.iter())
    }
}

impl Eq for FileCollectionFingerprint {}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::FileMetadata;

    fn file(path: &str, content: &str) -> Snapshot {
        Snapshot::regular_file(
            path,
            HashCode::from_bytes(content),
            FileMetadata {
                length: content.len() as u64,
                last_modified: 7,
            },
        )
    }

    fn tree(root: &str, files: &[(&str, &str)]) -> Arc<DirectoryTreeSnapshot> {
        Arc::new(DirectoryTreeSnapshot::new(
            Snapshot::directory(root),
            files
                .iter()
                .map(|(name, content)| file(&format!("{root}/{name}"), content))
                .collect(),
            true,
        ))
    }

    #[test]
    fn relocated_tree_is_up_to_date_under_relative_normalization() {
        let before = FileCollectionFingerprint::from_roots(
            vec![FingerprintRoot::Tree(tree("/old/src", &[("A.java", "a")]))],
            PathNormalization::Relative,
            CompareStrategy::Unordered,
        );
        let after = FileCollectionFingerprint::from_roots(
            vec![FingerprintRoot::Tree(tree("/new/src", &[("A.java", "a")]))],
            PathNormalization::Relative,
            CompareStrategy::Unordered,
        );
        assert!(after.diff(&before, "Input").is_empty());
        assert_eq!(after.hash(), before.hash());

        let absolute_before = FileCollectionFingerprint::from_roots(
            vec![FingerprintRoot::Tree(tree("/old/src", &[("A.java", "a")]))],
            PathNormalization::Absolute,
            CompareStrategy::Unordered,
        );
        let absolute_after = FileCollectionFingerprint::from_roots(
            vec![FingerprintRoot::Tree(tree("/new/src", &[("A.java", "a")]))],
            PathNormalization::Absolute,
            CompareStrategy::Unordered,
        );
        assert_eq!(absolute_after.diff(&absolute_before, "Input").len(), 4);
    }

    #[test]
    fn duplicate_absolute_paths_keep_the_first_root() {
        let fingerprint = FileCollectionFingerprint::from_roots(
            vec![
                FingerprintRoot::File(file("/work/a.txt", "a")),
                FingerprintRoot::Tree(tree("/work", &[("a.txt", "a")])),
            ],
            PathNormalization::Relative,
            CompareStrategy::Unordered,
        );
        let normalized: Vec<_> = fingerprint
            .entries()
            .values()
            .map(|e| e.normalized_path().to_owned())
            .collect();
        // The file was first seen as a root, so it keeps its root-file key.
        assert_eq!(normalized, ["a.txt", ""]);
    }

    #[test]
    fn empty_collections_share_the_canonical_fingerprint() {
        let fingerprint = FileCollectionFingerprint::from_roots(
            Vec::new(),
            PathNormalization::Relative,
            CompareStrategy::Ordered,
        );
        assert_eq!(&fingerprint, FileCollectionFingerprint::empty());
        assert!(fingerprint.roots().is_none());

        let ignored_dir_only = FileCollectionFingerprint::from_roots(
            vec![FingerprintRoot::Tree(tree("/work/empty", &[]))],
            PathNormalization::IgnoredPath,
            CompareStrategy::Unordered,
        );
        assert_eq!(&ignored_dir_only, FileCollectionFingerprint::empty());
    }

    #[test]
    fn diff_against_empty_reports_everything() {
        let fingerprint = FileCollectionFingerprint::from_roots(
            vec![FingerprintRoot::Tree(tree("/out", &[("a", "1"), ("b", "2")]))],
            PathNormalization::Relative,
            CompareStrategy::Unordered,
        );
        assert_eq!(fingerprint.diff(FileCollectionFingerprint::empty(), "Output").len(), 3);
        assert_eq!(
            FileCollectionFingerprint::empty()
                .diff(&fingerprint, "Output")
                .len(),
            3
        );
    }
}
