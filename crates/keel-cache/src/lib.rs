//! Cross-build memoization of hashing work.
//!
//! Every cache here is a [`CrossBuildCache`]: a bounded in-memory tier in
//! front of a [`PersistentStore`] that other processes may write to. The
//! store's generation is checked before each access and a foreign write drops
//! the in-memory tier, so a cache never answers from stale memory.
//!
//! On top of that sit the file-level hash cache ([`CachingFileHasher`], guarded
//! by [`FileTimeStampInspector`] against same-tick edits) and the derived hash
//! cache used by classpath hashing ([`ResourceHashCache`]).

mod codec;
mod cross_build;
mod error;
mod file_hasher;
mod file_store;
mod lock;
mod memory;
mod resource_cache;
mod store;
mod timestamps;

pub use cross_build::{CacheStatistics, CrossBuildCache};
pub use error::{CacheError, Result};
pub use file_hasher::{CachingFileHasher, FileHashEntry, FileHasherStatistics, SplitFileHasher};
pub use file_store::FileStore;
pub use memory::MemorySettings;
pub use resource_cache::{CachedHash, ResourceHashCache};
pub use store::{InMemoryStore, PersistentStore, StoreGeneration};
pub use timestamps::FileTimeStampInspector;
