use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::VfsError;

/// Include/exclude globs applied to paths relative to a walked root.
///
/// Paths use `/` separators. A file is selected when it matches some include
/// (or there are no includes) and no exclude. Directories are never filtered by
/// includes, since their children may still match; a directory matching an
/// exclude prunes its whole subtree. `dir/**` excludes therefore also match
/// `dir` itself.
#[derive(Clone, Debug)]
pub struct PatternSet {
    includes: Vec<String>,
    excludes: Vec<String>,
    include_set: GlobSet,
    file_excludes: GlobSet,
    directory_excludes: GlobSet,
}

impl PatternSet {
    pub fn new<I, E, S, T>(includes: I, excludes: E) -> Result<Self, VfsError>
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let includes: Vec<String> = includes.into_iter().map(Into::into).collect();
        let excludes: Vec<String> = excludes.into_iter().map(Into::into).collect();

        let mut include_set = GlobSetBuilder::new();
        for pattern in &includes {
            include_set.add(compile(pattern)?);
        }

        let mut file_excludes = GlobSetBuilder::new();
        let mut directory_excludes = GlobSetBuilder::new();
        for pattern in &excludes {
            let glob = compile(pattern)?;
            file_excludes.add(glob.clone());
            directory_excludes.add(glob);
            if let Some(dir) = pattern.strip_suffix("/**") {
                directory_excludes.add(compile(dir)?);
            }
        }

        Ok(Self {
            include_set: build(include_set, &includes)?,
            file_excludes: build(file_excludes, &excludes)?,
            directory_excludes: build(directory_excludes, &excludes)?,
            includes,
            excludes,
        })
    }

    /// Selects everything.
    pub fn all() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            include_set: GlobSet::empty(),
            file_excludes: GlobSet::empty(),
            directory_excludes: GlobSet::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    pub fn accepts_file(&self, relative_path: &str) -> bool {
        (self.includes.is_empty() || self.include_set.is_match(relative_path))
            && !self.file_excludes.is_match(relative_path)
    }

    pub fn accepts_directory(&self, relative_path: &str) -> bool {
        !self.directory_excludes.is_match(relative_path)
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::all()
    }
}

fn compile(pattern: &str) -> Result<Glob, VfsError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| VfsError::InvalidPattern {
            pattern: pattern.to_owned(),
            message: err.to_string(),
        })
}

fn build(builder: GlobSetBuilder, patterns: &[String]) -> Result<GlobSet, VfsError> {
    builder.build().map_err(|err| VfsError::InvalidPattern {
        pattern: patterns.join(", "),
        message: err.to_string(),
    })
}
