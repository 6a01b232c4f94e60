use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache persistence.
///
/// Callers on the hashing path treat every one of these as a cache miss; they
/// only surface from the store API itself.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("failed to lock cache at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry {path} belongs to a different key")]
    KeyMismatch { path: PathBuf },
}
