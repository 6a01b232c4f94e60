use std::collections::HashSet;

/// Version control and editor noise skipped by every directory walk.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/%*%",
    "**/.#*",
    "**/._*",
    "**/#*#",
    "**/*~",
    "**/.DS_Store",
    "**/CVS",
    "**/CVS/**",
    "**/.cvsignore",
    "**/SCCS",
    "**/SCCS/**",
    "**/.bzr",
    "**/.bzr/**",
    "**/.bzrignore",
    "**/vssver.scc",
    "**/.hg",
    "**/.hg/**",
    "**/.hgtags",
    "**/.hgignore",
    "**/.hgsubstate",
    "**/.hgsub",
    "**/.svn",
    "**/.svn/**",
    "**/.git",
    "**/.git/**",
    "**/.gitignore",
    "**/.gitmodules",
    "**/.gitattributes",
    "**/_darcs",
    "**/_darcs/**",
    "**/.darcsrepo",
    "**/-darcs-backup*",
    "**/.darcs-temp-mail",
];

/// Name-based exclusion rules compiled from `**/`-prefixed patterns.
///
/// Each pattern only looks at the final path component:
/// `**/name/**` excludes directories called `name`, a pattern without `*`
/// excludes files and directories with exactly that name, and a single `*`
/// splits the pattern into a required prefix and suffix.
#[derive(Clone, Debug, Default)]
pub struct DefaultExcludes {
    names: HashSet<String>,
    directory_names: HashSet<String>,
    wildcards: Vec<(String, String)>,
}

impl DefaultExcludes {
    pub fn new<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Self {
        let mut out = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let pattern = pattern.strip_prefix("**/").unwrap_or(pattern);
            if let Some(dir) = pattern.strip_suffix("/**") {
                out.directory_names.insert(dir.to_owned());
                continue;
            }
            match pattern.split_once('*') {
                None => {
                    out.names.insert(pattern.to_owned());
                }
                Some((prefix, suffix)) => {
                    if suffix.contains('*') {
                        tracing::debug!(
                            target = "keel.vfs",
                            pattern,
                            "ignoring default exclude with more than one wildcard"
                        );
                        continue;
                    }
                    out.wildcards.push((prefix.to_owned(), suffix.to_owned()));
                }
            }
        }
        out
    }

    /// No exclusions at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn excludes_file(&self, name: &str) -> bool {
        self.names.contains(name) || self.matches_wildcard(name)
    }

    pub fn excludes_directory(&self, name: &str) -> bool {
        self.directory_names.contains(name) || self.excludes_file(name)
    }

    fn matches_wildcard(&self, name: &str) -> bool {
        self.wildcards.iter().any(|(prefix, suffix)| {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix.as_str())
                && name.ends_with(suffix.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_builtin_patterns() {
        let excludes = DefaultExcludes::new(DEFAULT_EXCLUDES);

        assert!(excludes.excludes_directory(".git"));
        assert!(excludes.excludes_file(".gitignore"));
        assert!(excludes.excludes_file(".DS_Store"));
        assert!(excludes.excludes_file("Main.java~"));
        assert!(excludes.excludes_file("#scratch#"));
        assert!(excludes.excludes_file("-darcs-backup12"));
        assert!(excludes.excludes_file("%tmp%"));

        assert!(!excludes.excludes_file("Main.java"));
        assert!(!excludes.excludes_directory("src"));
        // A single `%` is too short to satisfy both prefix and suffix.
        assert!(!excludes.excludes_file("%"));
    }

    #[test]
    fn directory_only_rules_do_not_apply_to_files() {
        let excludes = DefaultExcludes::new(["**/build/**"]);
        assert!(excludes.excludes_directory("build"));
        assert!(!excludes.excludes_file("build"));
    }
}
