use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use keel_cache::{
    CacheStatistics, CachingFileHasher, CrossBuildCache, FileHasherStatistics, FileStore,
    FileTimeStampInspector, PersistentStore, ResourceHashCache, SplitFileHasher,
};
use keel_core::{DefaultFileHasher, FileHasher};
use keel_fingerprint::{
    AbiExtractor, Change, ClasspathHasher, CompareStrategy, DerivedHashCache, FileCollection,
    FileCollectionFingerprint, Fingerprinter, PathNormalization,
};
use keel_history::{
    filter_output_fingerprint, HistoricalExecution, OverlappingOutputs, TaskExecution,
    TaskHistoryRepository,
};
use keel_vfs::{
    DefaultExcludes, FileSystem, FileSystemMirror, FileSystemSnapshotter, LocalFs,
    SnapshotterStatistics,
};

use crate::changes::{self, ChangeReason};
use crate::config::EngineConfig;
use crate::error::Result;

/// Counters across the engine's caches, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStatistics {
    pub snapshotter: SnapshotterStatistics,
    pub file_hashes: FileHasherStatistics,
    pub global_file_hashes: FileHasherStatistics,
    pub resource_hashes: CacheStatistics,
}

/// The incremental-build state engine.
///
/// The scheduler brackets each build with [`Self::build_started`] and
/// [`Self::build_finished`], fingerprints task inputs and outputs through
/// the engine, and records each execution once the task has run. All
/// methods take `&self` and may be called from many worker threads.
pub struct StateEngine {
    config: EngineConfig,
    mirror: Arc<FileSystemMirror>,
    file_hashes: Arc<CachingFileHasher>,
    global_file_hashes: Arc<CachingFileHasher>,
    resource_hashes: Arc<ResourceHashCache>,
    fingerprinter: Fingerprinter,
    history: TaskHistoryRepository,
}

impl StateEngine {
    /// Opens the engine on the file-backed store under `config.cache_dir`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = FileStore::open(config.store_dir())?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn PersistentStore>) -> Self {
        Self::with_file_system(config, store, Arc::new(LocalFs))
    }

    pub fn with_file_system(
        config: EngineConfig,
        store: Arc<dyn PersistentStore>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let capacity = config.memory.tier_capacity();
        let mirror = Arc::new(FileSystemMirror::new(config.append_only_roots.iter().cloned()));
        let inspector = Arc::new(FileTimeStampInspector::new(config.boundary_marker()));

        let content: Arc<dyn FileHasher> = Arc::new(DefaultFileHasher);
        let file_hashes = Arc::new(CachingFileHasher::new(
            Arc::clone(&content),
            CrossBuildCache::new("file-hashes", Arc::clone(&store), capacity),
            Some(inspector),
        ));
        let global_file_hashes = Arc::new(CachingFileHasher::new(
            content,
            CrossBuildCache::new("global-file-hashes", Arc::clone(&store), capacity),
            None,
        ));
        let hasher = SplitFileHasher::new(
            Arc::clone(&mirror),
            Arc::clone(&global_file_hashes) as Arc<dyn FileHasher>,
            Arc::clone(&file_hashes) as Arc<dyn FileHasher>,
        );
        let snapshotter = FileSystemSnapshotter::new(
            fs,
            Arc::new(hasher),
            Arc::clone(&mirror),
            DefaultExcludes::new(&config.default_excludes),
        );
        let resource_hashes = Arc::new(ResourceHashCache::new(CrossBuildCache::new(
            "resource-hashes",
            Arc::clone(&store),
            capacity,
        )));
        let history = TaskHistoryRepository::new(store, capacity, config.max_history);

        tracing::debug!(
            target = "keel.engine",
            cache_dir = %config.cache_dir.display(),
            capacity = capacity.get(),
            max_history = config.max_history,
            "state engine opened"
        );
        Self {
            config,
            mirror,
            file_hashes,
            global_file_hashes,
            resource_hashes,
            fingerprinter: Fingerprinter::new(Arc::new(snapshotter)),
            history,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn history(&self) -> &TaskHistoryRepository {
        &self.history
    }

    pub fn build_started(&self) {
        self.file_hashes.build_started();
        tracing::debug!(target = "keel.engine", "build started");
    }

    /// Drops memoized snapshots before a task rewrites its outputs.
    pub fn before_output_change(&self) {
        self.mirror.before_output_change();
    }

    /// Clears build-scoped state, purges file hashes whose timestamps are
    /// still ambiguous and moves the build boundary.
    pub fn build_finished(&self) -> Result<()> {
        self.mirror.before_build_finished();
        self.file_hashes.build_finished()?;
        let statistics = self.statistics();
        tracing::debug!(
            target = "keel.engine",
            files_hashed = statistics.file_hashes.files_hashed,
            file_hash_hits = statistics.file_hashes.cache_hits,
            ambiguous = statistics.file_hashes.ambiguous,
            directory_walks = statistics.snapshotter.directory_walks,
            "build finished"
        );
        Ok(())
    }

    pub fn fingerprint(
        &self,
        collection: &FileCollection,
        normalization: PathNormalization,
        compare: CompareStrategy,
    ) -> Result<FileCollectionFingerprint> {
        Ok(self.fingerprinter.fingerprint(collection, normalization, compare)?)
    }

    pub fn fingerprint_classpath(
        &self,
        collection: &FileCollection,
        hasher: &ClasspathHasher,
    ) -> Result<FileCollectionFingerprint> {
        Ok(self.fingerprinter.fingerprint_classpath(collection, hasher)?)
    }

    /// Fingerprints files a task reported reading, by absolute path.
    pub fn fingerprint_discovered_inputs<P: Into<PathBuf>>(
        &self,
        paths: impl IntoIterator<Item = P>,
    ) -> Result<FileCollectionFingerprint> {
        let collection = FileCollection::new(paths);
        if collection.roots().is_empty() {
            return Ok(FileCollectionFingerprint::empty().clone());
        }
        self.fingerprint(&collection, PathNormalization::Absolute, CompareStrategy::Unordered)
    }

    /// A hasher for runtime classpaths, normalizing resources as configured.
    pub fn runtime_classpath_hasher(&self) -> Result<ClasspathHasher> {
        Ok(ClasspathHasher::runtime(
            &self.config.classpath.resource_normalization(),
            self.derived_hash_cache(),
        )?)
    }

    /// A hasher for compile classpaths, hashing classes through `extractor`.
    pub fn compile_classpath_hasher(&self, extractor: Arc<dyn AbiExtractor>) -> Result<ClasspathHasher> {
        Ok(ClasspathHasher::compile(
            &self.config.classpath.resource_normalization(),
            extractor,
            self.derived_hash_cache(),
        )?)
    }

    fn derived_hash_cache(&self) -> Arc<dyn DerivedHashCache> {
        Arc::clone(&self.resource_hashes) as Arc<dyn DerivedHashCache>
    }

    /// Changes from `previous` to `current`, in `current`'s compare strategy.
    pub fn diff(
        &self,
        current: &FileCollectionFingerprint,
        previous: &FileCollectionFingerprint,
        title: &str,
    ) -> Vec<Change> {
        current.diff(previous, title)
    }

    pub fn record_execution(&self, task: &str, execution: &TaskExecution) -> Result<()> {
        Ok(self.history.record_execution(task, execution)?)
    }

    pub fn best_previous_execution(
        &self,
        task: &str,
        declared_outputs: &BTreeSet<String>,
    ) -> Option<HistoricalExecution> {
        self.history.best_previous_execution(task, declared_outputs)
    }

    /// Up to `limit` reasons why `current` is out of date with respect to
    /// `previous`; empty when it is up to date.
    pub fn changes_since(
        &self,
        previous: &HistoricalExecution,
        current: &TaskExecution,
        limit: usize,
    ) -> Result<Vec<ChangeReason>> {
        Ok(changes::changes_since(previous, current, limit)?)
    }

    /// The first output property whose location holds files the previous
    /// execution did not leave there.
    pub fn detect_overlapping_outputs(
        &self,
        previous: Option<&HistoricalExecution>,
        outputs_before: &BTreeMap<String, FileCollectionFingerprint>,
    ) -> Result<Option<OverlappingOutputs>> {
        let previous_outputs = match previous {
            Some(previous) => Some(previous.output_files()?),
            None => None,
        };
        let overlapping = outputs_before.iter().find_map(|(property, before)| {
            let after_previous = previous_outputs.and_then(|outputs| outputs.get(property));
            OverlappingOutputs::detect(property, after_previous, before)
        });
        if let Some(overlapping) = &overlapping {
            tracing::debug!(
                target = "keel.engine",
                property = %overlapping.property_name,
                path = %overlapping.path,
                "overlapping outputs detected"
            );
        }
        Ok(overlapping)
    }

    /// The output fingerprints to record. With overlapping outputs, each
    /// property keeps only the files this task is considered to own.
    pub fn outputs_to_record(
        &self,
        previous: Option<&HistoricalExecution>,
        overlapping: Option<&OverlappingOutputs>,
        outputs_before: &BTreeMap<String, FileCollectionFingerprint>,
        outputs_after: BTreeMap<String, FileCollectionFingerprint>,
    ) -> Result<BTreeMap<String, FileCollectionFingerprint>> {
        if overlapping.is_none() {
            return Ok(outputs_after);
        }
        let previous_outputs = match previous {
            Some(previous) => Some(previous.output_files()?),
            None => None,
        };
        Ok(outputs_after
            .into_iter()
            .map(|(property, after)| {
                let after_previous = previous_outputs.and_then(|outputs| outputs.get(&property));
                let before = outputs_before
                    .get(&property)
                    .unwrap_or(FileCollectionFingerprint::empty());
                let filtered = filter_output_fingerprint(after_previous, before, &after);
                (property, filtered)
            })
            .collect())
    }

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            snapshotter: self.fingerprinter.snapshotter().statistics(),
            file_hashes: self.file_hashes.statistics(),
            global_file_hashes: self.global_file_hashes.statistics(),
            resource_hashes: self.resource_hashes.statistics(),
        }
    }
}

impl std::fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngine")
            .field("cache_dir", &self.config.cache_dir)
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}
