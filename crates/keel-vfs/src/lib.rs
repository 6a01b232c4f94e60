//! Filesystem snapshots and the process-wide mirror that memoizes them.
//!
//! Everything here is synchronous. Concurrent requests for the same path are
//! funnelled through a [`ProducerGuard`] so at most one thread stats, walks or
//! hashes a given location at a time; the others wait and reuse the result.

mod error;
mod excludes;
mod fs;
mod guard;
mod mirror;
mod patterns;
mod snapshotter;

pub use error::VfsError;
pub use excludes::{DefaultExcludes, DEFAULT_EXCLUDES};
pub use fs::{FileStat, FileSystem, LocalFs, StatKind};
pub use guard::ProducerGuard;
pub use mirror::FileSystemMirror;
pub use patterns::PatternSet;
pub use snapshotter::{FileSystemSnapshotter, SnapshotterStatistics};
