use keel_core::{DirectoryTreeSnapshot, HashCode, Snapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Process-wide memo of filesystem snapshots.
///
/// Paths under one of the append-only roots (an immutable artifact cache) live
/// in a region that is never invalidated. Everything else goes into the regular
/// region, which is dropped wholesale before any task output changes and when
/// the build finishes.
#[derive(Debug, Default)]
pub struct FileSystemMirror {
    append_only_roots: Vec<String>,
    append_only: RwLock<Region>,
    regular: RwLock<Region>,
}

#[derive(Debug, Default)]
struct Region {
    files: HashMap<Arc<str>, Snapshot>,
    trees: HashMap<Arc<str>, Arc<DirectoryTreeSnapshot>>,
    content: HashMap<Arc<str>, HashCode>,
}

impl Region {
    fn len(&self) -> usize {
        self.files.len() + self.trees.len() + self.content.len()
    }

    fn clear(&mut self) {
        self.files.clear();
        self.trees.clear();
        self.content.clear();
    }
}

impl FileSystemMirror {
    pub fn new<P: Into<PathBuf>>(append_only_roots: impl IntoIterator<Item = P>) -> Self {
        let append_only_roots = append_only_roots
            .into_iter()
            .map(|root| {
                let root: PathBuf = root.into();
                root.to_string_lossy()
                    .trim_end_matches(['/', '\\'])
                    .to_owned()
            })
            .filter(|root| !root.is_empty())
            .collect();
        Self {
            append_only_roots,
            ..Self::default()
        }
    }

    pub fn is_append_only(&self, path: &str) -> bool {
        self.append_only_roots.iter().any(|root| {
            path.strip_prefix(root.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '\\']))
        })
    }

    fn region(&self, path: &str) -> &RwLock<Region> {
        if self.is_append_only(path) {
            &self.append_only
        } else {
            &self.regular
        }
    }

    pub fn file(&self, path: &str) -> Option<Snapshot> {
        self.region(path).read().files.get(path).cloned()
    }

    pub fn put_file(&self, snapshot: Snapshot) {
        let key = Arc::clone(snapshot.shared_path());
        self.region(&key).write().files.insert(key, snapshot);
    }

    /// The cached *unfiltered* tree rooted at `path`, if any.
    pub fn directory_tree(&self, path: &str) -> Option<Arc<DirectoryTreeSnapshot>> {
        self.region(path).read().trees.get(path).cloned()
    }

    pub fn put_directory_tree(&self, tree: Arc<DirectoryTreeSnapshot>) {
        let key = Arc::clone(tree.root().shared_path());
        self.region(&key).write().trees.insert(key, tree);
    }

    pub fn content(&self, path: &str) -> Option<HashCode> {
        self.region(path).read().content.get(path).copied()
    }

    pub fn put_content(&self, path: Arc<str>, hash: HashCode) {
        self.region(&path).write().content.insert(path, hash);
    }

    /// Invalidates the regular region before a task rewrites its outputs.
    pub fn before_output_change(&self) {
        let mut regular = self.regular.write();
        tracing::trace!(
            target = "keel.vfs",
            entries = regular.len(),
            "clearing file system mirror before output change"
        );
        regular.clear();
    }

    pub fn before_build_finished(&self) {
        let mut regular = self.regular.write();
        tracing::debug!(
            target = "keel.vfs",
            entries = regular.len(),
            append_only_entries = self.append_only.read().len(),
            "clearing file system mirror at end of build"
        );
        regular.clear();
    }

    /// Number of cached entries in the regular region.
    pub fn regular_len(&self) -> usize {
        self.regular.read().len()
    }

    pub fn append_only_len(&self) -> usize {
        self.append_only.read().len()
    }

    pub fn path_key(path: &Path) -> Arc<str> {
        Arc::from(path.to_string_lossy().as_ref())
    }
}
