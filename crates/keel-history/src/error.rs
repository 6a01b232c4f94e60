use keel_cache::CacheError;

pub type Result<T> = std::result::Result<T, HistoryError>;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("input property '{property}' cannot be snapshotted: {message}")]
    UnrepresentableProperty { property: String, message: String },

    #[error("tree snapshot {id} is referenced but no longer stored")]
    MissingTreeSnapshot { id: u64 },
}
