use std::cmp::Ordering;
use std::sync::Arc;

use keel_core::{FileKind, HashBuilder, Snapshot};
use serde::{Deserialize, Serialize};

/// How the path of a file participates in a fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathNormalization {
    Absolute,
    /// Relative to the root the file was found under; root files use their name.
    Relative,
    NameOnly,
    /// Only content matters. Directories are left out entirely.
    IgnoredPath,
}

/// The normalized path of an entry.
///
/// Most normalized paths are a suffix of the absolute path (the relative path,
/// the file name, or the whole path), so they are stored as an offset into the
/// snapshot's path rather than as a second string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormalizedKey {
    Ignored,
    Suffix(u32),
    Owned(Arc<str>),
}

/// A snapshot together with its normalized path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedSnapshot {
    key: NormalizedKey,
    snapshot: Snapshot,
}

impl NormalizedSnapshot {
    pub fn new(normalized_path: &str, snapshot: Snapshot) -> Self {
        let absolute = snapshot.path();
        let key = match absolute.strip_suffix(normalized_path) {
            Some(head) if u32::try_from(head.len()).is_ok() => NormalizedKey::Suffix(head.len() as u32),
            _ => NormalizedKey::Owned(Arc::from(normalized_path)),
        };
        Self { key, snapshot }
    }

    pub fn ignored(snapshot: Snapshot) -> Self {
        Self {
            key: NormalizedKey::Ignored,
            snapshot,
        }
    }

    pub fn key(&self) -> &NormalizedKey {
        &self.key
    }

    pub fn normalized_path(&self) -> &str {
        match &self.key {
            NormalizedKey::Ignored => "",
            NormalizedKey::Suffix(offset) => self
                .snapshot
                .path()
                .get(*offset as usize..)
                .unwrap_or_default(),
            NormalizedKey::Owned(path) => path,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn absolute_path(&self) -> &Arc<str> {
        self.snapshot.shared_path()
    }

    /// Total order used wherever entries are sorted: normalized path first,
    /// then content hash.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        self.normalized_path()
            .cmp(other.normalized_path())
            .then_with(|| self.snapshot.content_hash().cmp(&other.snapshot.content_hash()))
    }

    pub fn append_to_hash(&self, hasher: &mut HashBuilder) {
        hasher
            .put_str(self.normalized_path())
            .put_hash(&self.snapshot.content_hash());
    }
}

impl PathNormalization {
    /// Normalizes a file or directory that was named directly as a root.
    pub fn normalize_root(self, snapshot: &Snapshot) -> Option<NormalizedSnapshot> {
        let is_directory = snapshot.kind() == FileKind::Directory;
        let normalized = match self {
            PathNormalization::Absolute => NormalizedSnapshot::new(snapshot.path(), snapshot.clone()),
            PathNormalization::IgnoredPath if is_directory => return None,
            PathNormalization::IgnoredPath => NormalizedSnapshot::ignored(snapshot.clone()),
            PathNormalization::Relative | PathNormalization::NameOnly if is_directory => {
                NormalizedSnapshot::ignored(snapshot.clone())
            }
            PathNormalization::Relative | PathNormalization::NameOnly => {
                NormalizedSnapshot::new(snapshot.name(), snapshot.clone())
            }
        };
        Some(normalized)
    }

    /// Normalizes an entry found below the root directory `root`.
    pub fn normalize_descendant(self, root: &str, snapshot: &Snapshot) -> Option<NormalizedSnapshot> {
        let normalized = match self {
            PathNormalization::Absolute => NormalizedSnapshot::new(snapshot.path(), snapshot.clone()),
            PathNormalization::IgnoredPath if snapshot.kind() == FileKind::Directory => {
                return None
            }
            PathNormalization::IgnoredPath => NormalizedSnapshot::ignored(snapshot.clone()),
            PathNormalization::Relative => {
                NormalizedSnapshot::new(&relative_path(root, snapshot.path()), snapshot.clone())
            }
            PathNormalization::NameOnly => NormalizedSnapshot::new(snapshot.name(), snapshot.clone()),
        };
        Some(normalized)
    }
}

/// `path` relative to `root`, with `/` separators.
pub(crate) fn relative_path(root: &str, path: &str) -> String {
    let rest = path.strip_prefix(root).unwrap_or(path);
    let rest = rest.trim_start_matches(['/', '\\']);
    if std::path::MAIN_SEPARATOR == '/' {
        rest.to_owned()
    } else {
        rest.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
