//! Core data model shared by every keel crate.
//!
//! This crate intentionally has no knowledge of the filesystem walker, the
//! content pipeline or persistence. It only defines the values those layers
//! exchange: content hashes, file snapshots and directory tree snapshots.

mod hash;
mod hasher;
mod snapshot;
mod time;
mod tree;

pub use hash::{HashBuilder, HashCode, ParseHashError};
pub use hasher::{DefaultFileHasher, FileHasher};
pub use snapshot::{FileKind, FileMetadata, Snapshot, SnapshotContent};
pub use time::{now_millis, system_time_millis};
pub use tree::DirectoryTreeSnapshot;
