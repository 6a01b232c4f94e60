use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `stat` reported something that is neither a file, a directory nor
    /// absent (sockets, devices, ...). This is never retried.
    #[error("unrecognized file type at {}", path.display())]
    UnrecognizedFileType { path: PathBuf },

    #[error("invalid file pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl VfsError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        VfsError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
