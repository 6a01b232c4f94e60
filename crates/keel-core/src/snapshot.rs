use crate::hash::HashCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Fixed content signature used when comparing directories.
pub(crate) const DIRECTORY_SIGNATURE: HashCode =
    HashCode::from_array(*b"keel:directory-signature\0\0\0\0\0\0\0\0");
/// Fixed content signature used when comparing missing files.
pub(crate) const MISSING_SIGNATURE: HashCode =
    HashCode::from_array(*b"keel:missing-file-signature\0\0\0\0\0");

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileKind {
    RegularFile,
    Directory,
    Missing,
}

/// Size and modification time of a regular file, as reported by `stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMetadata {
    pub length: u64,
    /// Milliseconds since the unix epoch.
    pub last_modified: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotContent {
    Directory,
    Missing,
    RegularFile {
        hash: HashCode,
        metadata: FileMetadata,
    },
}

/// A point-in-time view of a single filesystem location.
///
/// `Missing` is an ordinary snapshot, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot {
    path: Arc<str>,
    content: SnapshotContent,
}

impl Snapshot {
    pub fn new(path: impl Into<Arc<str>>, content: SnapshotContent) -> Self {
        Self {
            path: path.into(),
            content,
        }
    }

    pub fn directory(path: impl Into<Arc<str>>) -> Self {
        Self::new(path, SnapshotContent::Directory)
    }

    pub fn missing(path: impl Into<Arc<str>>) -> Self {
        Self::new(path, SnapshotContent::Missing)
    }

    pub fn regular_file(path: impl Into<Arc<str>>, hash: HashCode, metadata: FileMetadata) -> Self {
        Self::new(path, SnapshotContent::RegularFile { hash, metadata })
    }

    /// The absolute path, as a string. Normalized keys may point into it.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn shared_path(&self) -> &Arc<str> {
        &self.path
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&*self.path)
    }

    /// The final path component, or the whole path for roots.
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches(is_separator);
        if trimmed.is_empty() {
            return &self.path;
        }
        match trimmed.rfind(is_separator) {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        }
    }

    pub fn content(&self) -> &SnapshotContent {
        &self.content
    }

    pub fn kind(&self) -> FileKind {
        match self.content {
            SnapshotContent::Directory => FileKind::Directory,
            SnapshotContent::Missing => FileKind::Missing,
            SnapshotContent::RegularFile { .. } => FileKind::RegularFile,
        }
    }

    pub fn metadata(&self) -> Option<FileMetadata> {
        match self.content {
            SnapshotContent::RegularFile { metadata, .. } => Some(metadata),
            _ => None,
        }
    }

    /// The hash used for content comparison. Directories and missing files
    /// compare by fixed signatures.
    pub fn content_hash(&self) -> HashCode {
        match self.content {
            SnapshotContent::Directory => DIRECTORY_SIGNATURE,
            SnapshotContent::Missing => MISSING_SIGNATURE,
            SnapshotContent::RegularFile { hash, .. } => hash,
        }
    }

    pub fn is_content_up_to_date(&self, other: &Snapshot) -> bool {
        self.kind() == other.kind() && self.content_hash() == other.content_hash()
    }

    pub fn is_content_and_metadata_up_to_date(&self, other: &Snapshot) -> bool {
        self.content == other.content
    }

    /// Rebinds the snapshot to a different absolute path, keeping its content.
    pub fn with_path(&self, path: impl Into<Arc<str>>) -> Self {
        Self {
            path: path.into(),
            content: self.content,
        }
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == std::path::MAIN_SEPARATOR
}
