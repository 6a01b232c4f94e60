use keel_core::HashCode;
use keel_fingerprint::{DerivedHashCache, HashError};
use serde::{Deserialize, Serialize};

use crate::cross_build::CrossBuildCache;

/// A derived hash as persisted. `NoHash` records that the resource was
/// excluded, so the exclusion is not recomputed either.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedHash {
    Hash(HashCode),
    NoHash,
}

impl From<Option<HashCode>> for CachedHash {
    fn from(hash: Option<HashCode>) -> Self {
        hash.map_or(CachedHash::NoHash, CachedHash::Hash)
    }
}

impl From<CachedHash> for Option<HashCode> {
    fn from(cached: CachedHash) -> Self {
        match cached {
            CachedHash::Hash(hash) => Some(hash),
            CachedHash::NoHash => None,
        }
    }
}

/// Memoizes hashes derived from file content (archive fingerprints, class
/// ABIs) keyed by `(content hash, configuration hash)`.
#[derive(Debug)]
pub struct ResourceHashCache {
    cache: CrossBuildCache<(HashCode, HashCode), CachedHash>,
}

impl ResourceHashCache {
    pub fn new(cache: CrossBuildCache<(HashCode, HashCode), CachedHash>) -> Self {
        Self { cache }
    }

    pub fn statistics(&self) -> crate::CacheStatistics {
        self.cache.statistics()
    }
}

impl DerivedHashCache for ResourceHashCache {
    fn get_or_compute(
        &self,
        content_hash: HashCode,
        configuration_hash: HashCode,
        compute: &mut dyn FnMut() -> Result<Option<HashCode>, HashError>,
    ) -> Result<Option<HashCode>, HashError> {
        self.cache
            .get_or_compute(&(content_hash, configuration_hash), || {
                compute().map(CachedHash::from)
            })
            .map(Option::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    #[test]
    fn no_hash_results_are_cached_too() {
        let cache = ResourceHashCache::new(CrossBuildCache::new(
            "resources",
            Arc::new(InMemoryStore::new()),
            NonZeroUsize::new(4).unwrap(),
        ));
        let content = HashCode::from_bytes("content");
        let config = HashCode::from_bytes("config");
        let mut calls = 0;
        for _ in 0..3 {
            let result = cache
                .get_or_compute(content, config, &mut || {
                    calls += 1;
                    Ok(None)
                })
                .unwrap();
            assert_eq!(result, None);
        }
        assert_eq!(calls, 1);

        let other_config = HashCode::from_bytes("other");
        let derived = cache
            .get_or_compute(content, other_config, &mut || Ok(Some(HashCode::from_bytes("abi"))))
            .unwrap();
        assert_eq!(derived, Some(HashCode::from_bytes("abi")));
    }
}
