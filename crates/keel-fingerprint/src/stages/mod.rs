//! Built-in [`ResourceStage`](crate::ResourceStage)s.

mod ignore;
mod manifest;
mod properties;

pub use ignore::IgnoreFilterStage;
pub use manifest::{ManifestStage, MANIFEST_PATH};
pub use properties::{PropertiesStage, DEFAULT_PROPERTIES_PATTERNS};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::HashError;

/// Compiles `/`-aware globs matched against resource paths.
pub(crate) fn compile_globs(patterns: &[String]) -> Result<GlobSet, HashError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| HashError::InvalidPattern {
                pattern: pattern.clone(),
                message: err.to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| HashError::InvalidPattern {
        pattern: patterns.join(", "),
        message: err.to_string(),
    })
}
