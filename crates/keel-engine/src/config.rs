use std::path::{Path, PathBuf};

use keel_cache::MemorySettings;
use keel_fingerprint::stages::DEFAULT_PROPERTIES_PATTERNS;
use keel_fingerprint::{LineEndingSensitivity, ResourceNormalization};
use keel_vfs::DEFAULT_EXCLUDES;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine configuration, usually read from a `keel.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the persistent store and the build boundary marker.
    pub cache_dir: PathBuf,

    /// Executions kept per task.
    pub max_history: usize,

    /// Roots whose content never changes once written (the artifact cache).
    /// Their file hashes live in a global cache not subject to timestamp
    /// ambiguity checks.
    pub append_only_roots: Vec<PathBuf>,

    /// Patterns skipped by every directory walk.
    pub default_excludes: Vec<String>,

    pub classpath: ClasspathConfig,

    pub memory: MemorySettings,

    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".keel"),
            max_history: keel_history::DEFAULT_MAX_HISTORY,
            append_only_roots: Vec::new(),
            default_excludes: DEFAULT_EXCLUDES.iter().map(|p| (*p).to_owned()).collect(),
            classpath: ClasspathConfig::default(),
            memory: MemorySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.cache_dir.join("store")
    }

    pub fn boundary_marker(&self) -> PathBuf {
        self.cache_dir.join("build-boundary")
    }
}

/// How classpath resources are normalized before hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClasspathConfig {
    /// Globs of resources left out of classpath fingerprints entirely.
    pub ignored_resources: Vec<String>,
    /// Manifest attribute names (case-insensitive) to drop.
    pub ignored_manifest_attributes: Vec<String>,
    /// Named manifest sections to drop.
    pub ignored_manifest_sections: Vec<String>,
    /// Globs of resources hashed as properties files.
    pub properties_patterns: Vec<String>,
    /// Property keys to drop from properties files.
    pub ignored_properties: Vec<String>,
    pub normalize_line_endings: bool,
}

impl Default for ClasspathConfig {
    fn default() -> Self {
        Self {
            ignored_resources: Vec::new(),
            ignored_manifest_attributes: Vec::new(),
            ignored_manifest_sections: Vec::new(),
            properties_patterns: DEFAULT_PROPERTIES_PATTERNS
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
            ignored_properties: Vec::new(),
            normalize_line_endings: false,
        }
    }
}

impl ClasspathConfig {
    pub fn resource_normalization(&self) -> ResourceNormalization {
        ResourceNormalization {
            ignored_resources: self.ignored_resources.clone(),
            ignored_manifest_attributes: self.ignored_manifest_attributes.clone(),
            ignored_manifest_sections: self.ignored_manifest_sections.clone(),
            properties_patterns: self.properties_patterns.clone(),
            ignored_properties: self.ignored_properties.clone(),
            line_endings: if self.normalize_line_endings {
                LineEndingSensitivity::NormalizeLineEndings
            } else {
                LineEndingSensitivity::Default
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    pub level: String,
    /// Emit logs as JSON lines.
    pub json: bool,
    /// Write logs to stderr; when disabled no subscriber is installed.
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
            stderr: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes the offending input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::load_from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_history, 3);
        assert!(config.default_excludes.iter().any(|p| p == "**/.git/**"));
        assert_eq!(
            config.classpath.properties_patterns,
            vec!["META-INF/*.properties".to_owned()]
        );
    }

    #[test]
    fn sections_override_only_what_they_name() {
        let config = EngineConfig::load_from_str(
            r#"
cache_dir = "/tmp/keel"
max_history = 5
append_only_roots = ["/home/me/.cache/artifacts"]

[classpath]
ignored_resources = ["**/build-info.txt"]
normalize_line_endings = true

[memory]
min_entries = 10

[logging]
level = "debug"
json = true
"#,
        )
        .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/keel"));
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/keel/store"));
        assert_eq!(config.max_history, 5);
        assert_eq!(
            config.append_only_roots,
            vec![PathBuf::from("/home/me/.cache/artifacts")]
        );
        assert_eq!(config.default_excludes, EngineConfig::default().default_excludes);

        let normalization = config.classpath.resource_normalization();
        assert_eq!(normalization.ignored_resources, vec!["**/build-info.txt".to_owned()]);
        assert_eq!(
            normalization.line_endings,
            LineEndingSensitivity::NormalizeLineEndings
        );

        assert_eq!(config.memory.min_entries, 10);
        assert_eq!(config.memory.max_entries, MemorySettings::default().max_entries);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert!(config.logging.stderr);
    }

    #[test]
    fn parse_errors_do_not_echo_the_input() {
        let err = EngineConfig::load_from_str("max_history = \"secret-value\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
        assert!(!err.to_string().contains("max_history = \"secret-value\""));
    }

    #[test]
    fn missing_file_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        let err = EngineConfig::load_from_path(&path).unwrap_err();
        match err {
            ConfigError::Io { path: reported, .. } => assert_eq!(reported, path.display().to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, "max_history = 1\n").unwrap();
        assert_eq!(EngineConfig::load_from_path(&path).unwrap().max_history, 1);
    }
}
