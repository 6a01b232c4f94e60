use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use keel_core::system_time_millis;
use parking_lot::Mutex;

use crate::error::Result;

/// Decides whether a file's modification time can be trusted to detect
/// changes.
///
/// The mtime of a marker file is the build boundary: it is touched when a
/// build finishes. A file whose mtime equals the boundary may have been
/// written in the same clock tick as the marker, before or after it, so it
/// cannot be told apart from an unchanged file and must be rehashed.
#[derive(Debug)]
pub struct FileTimeStampInspector {
    marker: PathBuf,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    boundary: Option<u64>,
    /// Paths hashed while their mtime equalled the boundary.
    ambiguous: HashSet<PathBuf>,
}

impl FileTimeStampInspector {
    /// Reads the boundary from `marker`. A missing marker means there is no
    /// boundary yet.
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        let marker = marker.into();
        let boundary = read_mtime(&marker);
        Self {
            marker,
            state: Mutex::new(State {
                boundary,
                ambiguous: HashSet::new(),
            }),
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn boundary(&self) -> Option<u64> {
        self.state.lock().boundary
    }

    /// Re-reads the boundary; another process may have finished a build.
    pub fn build_started(&self) {
        self.state.lock().boundary = read_mtime(&self.marker);
    }

    /// Whether `last_modified` (millis) of the file at `path` tells changes
    /// apart. Untrusted paths are remembered for [`Self::build_finished`].
    pub fn timestamp_can_be_trusted(&self, path: &Path, last_modified: u64) -> bool {
        let mut state = self.state.lock();
        if state.boundary != Some(last_modified) {
            return true;
        }
        state.ambiguous.insert(path.to_path_buf());
        false
    }

    /// Calls `purge` for every remembered path whose mtime still equals the
    /// boundary, then touches the marker to set the next boundary.
    pub fn build_finished(&self, mut purge: impl FnMut(&Path)) -> Result<()> {
        let mut state = self.state.lock();
        let boundary = state.boundary;
        for path in state.ambiguous.drain() {
            if boundary.is_some() && read_mtime(&path) == boundary {
                tracing::debug!(
                    target = "keel.cache",
                    path = %path.display(),
                    "timestamp still ambiguous at end of build; purging"
                );
                purge(&path);
            }
        }
        state.boundary = Some(touch(&self.marker)?);
        Ok(())
    }
}

fn read_mtime(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(system_time_millis(modified))
}

/// Sets the mtime of `path` to now, creating it if needed, and returns the
/// mtime as stored by the filesystem.
fn touch(path: &Path) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file: File = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.set_modified(SystemTime::now())?;
    let modified = file.metadata()?.modified()?;
    Ok(system_time_millis(modified))
}
