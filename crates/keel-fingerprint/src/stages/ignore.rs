use globset::GlobSet;
use keel_core::{HashBuilder, HashCode};

use crate::error::HashError;
use crate::resource::{Next, ResourceEntry, ResourceStage};

/// Drops resources whose path matches one of the configured globs.
#[derive(Debug, Clone)]
pub struct IgnoreFilterStage {
    patterns: Vec<String>,
    set: GlobSet,
}

impl IgnoreFilterStage {
    pub fn new(mut patterns: Vec<String>) -> Result<Self, HashError> {
        patterns.sort();
        patterns.dedup();
        let set = super::compile_globs(&patterns)?;
        Ok(Self { patterns, set })
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.set.is_match(path)
    }
}

impl ResourceStage for IgnoreFilterStage {
    fn append_configuration_to(&self, hasher: &mut HashBuilder) {
        hasher
            .put_str("ignore")
            .put_u64(self.patterns.len() as u64);
        for pattern in &self.patterns {
            hasher.put_str(pattern);
        }
    }

    fn hash(
        &self,
        entry: &ResourceEntry<'_>,
        next: Next<'_>,
    ) -> Result<Option<HashCode>, HashError> {
        if self.is_ignored(entry.path()) {
            return Ok(None);
        }
        next.hash(entry)
    }
}
