use std::io;
use std::path::PathBuf;

use keel_archive::ArchiveError;
use keel_vfs::VfsError;

/// Errors that abort fingerprinting. Recoverable conditions (malformed
/// archives, unparsable manifests) never surface here; they degrade to a
/// coarser hash instead.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An I/O failure while reading an archive. Structural damage is handled
    /// by falling back to the whole-file hash and never produces this.
    #[error("failed to read archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error(transparent)]
    Snapshot(#[from] VfsError),

    #[error("invalid resource pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl HashError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        HashError::Io {
            path: path.into(),
            source,
        }
    }
}
