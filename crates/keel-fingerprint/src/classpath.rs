use std::fmt;
use std::sync::Arc;

use keel_archive::is_archive_name;
use keel_core::{HashBuilder, HashCode, Snapshot, SnapshotContent};
use serde::{Deserialize, Serialize};

use crate::archive::ZipHasher;
use crate::error::HashError;
use crate::resource::{
    AbiExtractor, AbiHasher, BaseHasher, LineEndingSensitivity, RawContentHasher, ResourceEntry,
    ResourceHasher, ResourcePipeline, ResourceStage,
};
use crate::stages::{IgnoreFilterStage, ManifestStage, PropertiesStage, DEFAULT_PROPERTIES_PATTERNS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClasspathMode {
    /// Everything on the classpath matters, byte for byte.
    Runtime,
    /// Classes only matter through their ABI.
    Compile,
}

/// Memoizes hashes derived from file content, keyed by
/// `(content hash, configuration hash)`.
pub trait DerivedHashCache: Send + Sync {
    fn get_or_compute(
        &self,
        content_hash: HashCode,
        configuration_hash: HashCode,
        compute: &mut dyn FnMut() -> Result<Option<HashCode>, HashError>,
    ) -> Result<Option<HashCode>, HashError>;
}

/// Computes every time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDerivedHashCache;

impl DerivedHashCache for NoDerivedHashCache {
    fn get_or_compute(
        &self,
        _content_hash: HashCode,
        _configuration_hash: HashCode,
        compute: &mut dyn FnMut() -> Result<Option<HashCode>, HashError>,
    ) -> Result<Option<HashCode>, HashError> {
        compute()
    }
}

/// Knobs for how classpath resources are normalized before hashing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNormalization {
    pub ignored_resources: Vec<String>,
    pub ignored_manifest_attributes: Vec<String>,
    pub ignored_manifest_sections: Vec<String>,
    pub properties_patterns: Vec<String>,
    pub ignored_properties: Vec<String>,
    pub line_endings: LineEndingSensitivity,
}

impl Default for ResourceNormalization {
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
            line_endings: LineEndingSensitivity::Default,
        }
    }
}

impl ResourceNormalization {
    /// Builds the pipeline: ignore filter, manifest, properties, then `base`.
    pub fn build_pipeline(&self, base: Box<dyn BaseHasher>) -> Result<ResourcePipeline, HashError> {
        let mut stages: Vec<Box<dyn ResourceStage>> = Vec::new();
        if !self.ignored_resources.is_empty() {
            stages.push(Box::new(IgnoreFilterStage::new(self.ignored_resources.clone())?));
        }
        stages.push(Box::new(ManifestStage::new(
            &self.ignored_manifest_attributes,
            &self.ignored_manifest_sections,
        )));
        stages.push(Box::new(PropertiesStage::new(
            self.properties_patterns.clone(),
            self.ignored_properties.iter().cloned(),
        )?));
        Ok(ResourcePipeline::new(stages, base))
    }
}

/// Hashes classpath roots and the files below classpath directories.
pub struct ClasspathHasher {
    mode: ClasspathMode,
    resources: Arc<dyn ResourceHasher>,
    archives: ZipHasher,
    cache: Arc<dyn DerivedHashCache>,
    configuration_hash: HashCode,
}

impl ClasspathHasher {
    pub fn runtime(
        normalization: &ResourceNormalization,
        cache: Arc<dyn DerivedHashCache>,
    ) -> Result<Self, HashError> {
        let base = RawContentHasher::new(normalization.line_endings);
        let pipeline = normalization.build_pipeline(Box::new(base))?;
        Ok(Self::new(ClasspathMode::Runtime, Arc::new(pipeline), cache))
    }

    pub fn compile(
        normalization: &ResourceNormalization,
        extractor: Arc<dyn AbiExtractor>,
        cache: Arc<dyn DerivedHashCache>,
    ) -> Result<Self, HashError> {
        let base = AbiHasher::new(extractor, RawContentHasher::new(normalization.line_endings));
        let pipeline = normalization.build_pipeline(Box::new(base))?;
        Ok(Self::new(ClasspathMode::Compile, Arc::new(pipeline), cache))
    }

    pub fn new(
        mode: ClasspathMode,
        resources: Arc<dyn ResourceHasher>,
        cache: Arc<dyn DerivedHashCache>,
    ) -> Self {
        let archives = ZipHasher::new(Arc::clone(&resources));
        let mut hasher = HashBuilder::new();
        hasher
            .put_str("classpath")
            .put_bool(mode == ClasspathMode::Compile)
            .put_hash(&archives.configuration_hash());
        Self {
            mode,
            resources,
            archives,
            cache,
            configuration_hash: hasher.finish(),
        }
    }

    pub fn mode(&self) -> ClasspathMode {
        self.mode
    }

    pub fn configuration_hash(&self) -> HashCode {
        self.configuration_hash
    }

    /// Hash of a file named directly on the classpath. Archives are hashed
    /// by content, other files go through the resource pipeline under their
    /// file name. Both are memoized. Directories and missing files yield
    /// `None`.
    pub fn hash_root_file(&self, snapshot: &Snapshot) -> Result<Option<HashCode>, HashError> {
        let SnapshotContent::RegularFile { hash, .. } = *snapshot.content() else {
            return Ok(None);
        };
        if is_archive_name(snapshot.name()) {
            return self
                .cache
                .get_or_compute(hash, self.configuration_hash, &mut || {
                    self.archives.hash_archive(snapshot.as_path(), hash).map(Some)
                });
        }
        self.hash_resource_file(snapshot.name(), snapshot, hash)
    }

    /// Hash of a regular file found below a classpath directory, at
    /// `relative_path`.
    pub fn hash_directory_entry(
        &self,
        relative_path: &str,
        snapshot: &Snapshot,
    ) -> Result<Option<HashCode>, HashError> {
        let SnapshotContent::RegularFile { hash, .. } = *snapshot.content() else {
            return Ok(None);
        };
        self.hash_resource_file(relative_path, snapshot, hash)
    }

    /// Pipeline stages look at the resource path, so the path is part of
    /// the memoization key next to the content hash.
    fn hash_resource_file(
        &self,
        path: &str,
        snapshot: &Snapshot,
        content_hash: HashCode,
    ) -> Result<Option<HashCode>, HashError> {
        let mut key = HashBuilder::new();
        key.put_hash(&self.configuration_hash).put_str("resource").put_str(path);
        self.cache.get_or_compute(content_hash, key.finish(), &mut || {
            let bytes = std::fs::read(snapshot.as_path())
                .map_err(|err| HashError::io(snapshot.as_path(), err))?;
            self.resources.hash(&ResourceEntry::new(path, &bytes))
        })
    }
}

impl fmt::Debug for ClasspathHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClasspathHasher")
            .field("mode", &self.mode)
            .field("configuration_hash", &self.configuration_hash)
            .finish()
    }
}
