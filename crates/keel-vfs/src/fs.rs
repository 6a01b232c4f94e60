use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use keel_core::system_time_millis;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatKind {
    RegularFile,
    Directory,
    Missing,
    /// Anything else `stat` can report (sockets, fifos, devices).
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub kind: StatKind,
    pub length: u64,
    /// Milliseconds since the unix epoch.
    pub last_modified: u64,
}

impl FileStat {
    pub fn missing() -> Self {
        Self {
            kind: StatKind::Missing,
            length: 0,
            last_modified: 0,
        }
    }
}

/// The filesystem primitives the snapshotter needs.
///
/// Kept deliberately small so tests can wrap [`LocalFs`] to count or slow
/// down calls. File contents are read by the [`keel_core::FileHasher`].
pub trait FileSystem: Send + Sync {
    /// Follows symlinks. A path that does not exist (including a dangling
    /// symlink) is reported as [`StatKind::Missing`], not as an error.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Lists the children of a directory, sorted by file name.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Local OS file system implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FileStat::missing()),
            Err(err) => return Err(err),
        };
        let kind = if meta.is_file() {
            StatKind::RegularFile
        } else if meta.is_dir() {
            StatKind::Directory
        } else {
            StatKind::Other
        };
        let last_modified = meta.modified().map(system_time_millis).unwrap_or(0);
        Ok(FileStat {
            kind,
            length: if kind == StatKind::RegularFile { meta.len() } else { 0 },
            last_modified,
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            out.push(entry.path());
        }
        out.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(out)
    }
}
