use crate::hash::HashCode;
use crate::snapshot::FileMetadata;
use std::io;
use std::path::Path;

/// Hashes the content of regular files.
///
/// Callers pass the metadata they already observed so caching implementations
/// can validate entries without a second `stat`.
pub trait FileHasher: Send + Sync {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> io::Result<HashCode>;
}

/// Streams the file through SHA-256 on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFileHasher;

impl FileHasher for DefaultFileHasher {
    fn hash(&self, path: &Path, _metadata: FileMetadata) -> io::Result<HashCode> {
        HashCode::from_file(path)
    }
}

impl<T: FileHasher + ?Sized> FileHasher for std::sync::Arc<T> {
    fn hash(&self, path: &Path, metadata: FileMetadata) -> io::Result<HashCode> {
        (**self).hash(path, metadata)
    }
}
