use keel_cache::CacheError;
use keel_fingerprint::HashError;
use keel_history::HistoryError;
use keel_vfs::VfsError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Snapshot(#[from] VfsError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
