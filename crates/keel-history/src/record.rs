use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keel_core::{DirectoryTreeSnapshot, Snapshot};
use keel_fingerprint::{
    CompareStrategy, FileCollectionFingerprint, FingerprintRoot, FingerprintingStrategy,
    PathNormalization,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::trees::TreeSnapshotRepository;
use crate::value::{ImplementationSnapshot, ValueSnapshot};

/// One execution of a task as reported by the scheduler.
#[derive(Clone, Debug)]
pub struct TaskExecution {
    pub build_id: String,
    pub successful: bool,
    pub task_implementation: ImplementationSnapshot,
    pub action_implementations: Vec<ImplementationSnapshot>,
    pub input_properties: BTreeMap<String, ValueSnapshot>,
    pub input_files: BTreeMap<String, FileCollectionFingerprint>,
    pub output_files: BTreeMap<String, FileCollectionFingerprint>,
    /// Files the task reported reading while it ran.
    pub discovered_inputs: FileCollectionFingerprint,
    /// Absolute paths of the declared outputs.
    pub declared_outputs: BTreeSet<String>,
}

impl TaskExecution {
    pub fn new(build_id: impl Into<String>, task_implementation: ImplementationSnapshot) -> Self {
        Self {
            build_id: build_id.into(),
            successful: true,
            task_implementation,
            action_implementations: Vec::new(),
            input_properties: BTreeMap::new(),
            input_files: BTreeMap::new(),
            output_files: BTreeMap::new(),
            discovered_inputs: FileCollectionFingerprint::empty().clone(),
            declared_outputs: BTreeSet::new(),
        }
    }

    /// Snapshots and records the value of an input property.
    pub fn add_input_property<T>(&mut self, name: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let snapshot = ValueSnapshot::of(name, value)?;
        self.input_properties.insert(name.to_owned(), snapshot);
        Ok(())
    }
}

/// A fingerprint root as persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum StoredRoot {
    File(Snapshot),
    /// A shareable tree kept by the [`TreeSnapshotRepository`].
    SharedTree(u64),
    Tree {
        root: Snapshot,
        descendants: Vec<Snapshot>,
    },
}

/// A fingerprint as persisted: either its entries, or the roots it was
/// built from with shareable trees replaced by their ids.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum StoredFingerprint {
    Entries(FileCollectionFingerprint),
    Roots {
        id: u64,
        normalization: PathNormalization,
        compare: CompareStrategy,
        roots: Vec<StoredRoot>,
    },
}

impl StoredFingerprint {
    pub(crate) fn store(
        fingerprint: &FileCollectionFingerprint,
        trees: &TreeSnapshotRepository,
    ) -> Result<Self> {
        let (FingerprintingStrategy::Path(normalization), Some(roots)) =
            (fingerprint.strategy(), fingerprint.roots())
        else {
            return Ok(StoredFingerprint::Entries(fingerprint.clone()));
        };
        let shared: Vec<Arc<DirectoryTreeSnapshot>> = roots
            .iter()
            .filter_map(|root| match root {
                FingerprintRoot::Tree(tree) if tree.is_shareable() => Some(Arc::clone(tree)),
                _ => None,
            })
            .collect();
        if shared.is_empty() {
            return Ok(StoredFingerprint::Entries(fingerprint.clone()));
        }

        let id = trees.next_id()?;
        if let Err(err) = trees.store_references(id, &shared) {
            trees.release_after_failure(&[id]);
            return Err(err);
        }
        let roots = roots
            .iter()
            .map(|root| match root {
                FingerprintRoot::File(snapshot) => StoredRoot::File(snapshot.clone()),
                FingerprintRoot::Tree(tree) => match tree.assigned_id() {
                    Some(tree_id) if tree.is_shareable() => StoredRoot::SharedTree(tree_id),
                    _ => StoredRoot::Tree {
                        root: tree.root().clone(),
                        descendants: tree.descendants().to_vec(),
                    },
                },
            })
            .collect();
        Ok(StoredFingerprint::Roots {
            id,
            normalization,
            compare: fingerprint.compare_strategy(),
            roots,
        })
    }

    pub(crate) fn load(&self, trees: &TreeSnapshotRepository) -> Result<FileCollectionFingerprint> {
        match self {
            StoredFingerprint::Entries(fingerprint) => Ok(fingerprint.clone()),
            StoredFingerprint::Roots {
                normalization,
                compare,
                roots,
                ..
            } => {
                let roots = roots
                    .iter()
                    .map(|root| -> Result<FingerprintRoot> {
                        Ok(match root {
                            StoredRoot::File(snapshot) => FingerprintRoot::File(snapshot.clone()),
                            StoredRoot::SharedTree(id) => FingerprintRoot::Tree(trees.load(*id)?),
                            StoredRoot::Tree { root, descendants } => {
                                FingerprintRoot::Tree(Arc::new(DirectoryTreeSnapshot::new(
                                    root.clone(),
                                    descendants.clone(),
                                    false,
                                )))
                            }
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(FileCollectionFingerprint::from_roots(roots, *normalization, *compare))
            }
        }
    }

    pub(crate) fn id(&self) -> Option<u64> {
        match self {
            StoredFingerprint::Entries(_) => None,
            StoredFingerprint::Roots { id, .. } => Some(*id),
        }
    }
}

/// The persisted form of a [`TaskExecution`]. Never changed once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub build_id: String,
    pub successful: bool,
    pub task_implementation: ImplementationSnapshot,
    pub action_implementations: Vec<ImplementationSnapshot>,
    pub input_properties: BTreeMap<String, ValueSnapshot>,
    pub declared_outputs: BTreeSet<String>,
    pub(crate) input_files: BTreeMap<String, StoredFingerprint>,
    pub(crate) output_files: BTreeMap<String, StoredFingerprint>,
    pub(crate) discovered_inputs: StoredFingerprint,
}

impl TaskExecutionRecord {
    /// Stores the fingerprints of `execution`, registering their tree
    /// references. On failure the references registered so far are released.
    pub(crate) fn store(execution: &TaskExecution, trees: &TreeSnapshotRepository) -> Result<Self> {
        let mut registered = Vec::new();
        let stored = Self::store_fingerprints(execution, trees, &mut registered);
        if stored.is_err() {
            trees.release_after_failure(&registered);
        }
        stored
    }

    fn store_fingerprints(
        execution: &TaskExecution,
        trees: &TreeSnapshotRepository,
        registered: &mut Vec<u64>,
    ) -> Result<Self> {
        let mut store_one = |fingerprint: &FileCollectionFingerprint| -> Result<StoredFingerprint> {
            let stored = StoredFingerprint::store(fingerprint, trees)?;
            registered.extend(stored.id());
            Ok(stored)
        };
        let mut input_files = BTreeMap::new();
        for (property, fingerprint) in &execution.input_files {
            input_files.insert(property.clone(), store_one(fingerprint)?);
        }
        let mut output_files = BTreeMap::new();
        for (property, fingerprint) in &execution.output_files {
            output_files.insert(property.clone(), store_one(fingerprint)?);
        }
        let discovered_inputs = store_one(&execution.discovered_inputs)?;
        Ok(Self {
            build_id: execution.build_id.clone(),
            successful: execution.successful,
            task_implementation: execution.task_implementation.clone(),
            action_implementations: execution.action_implementations.clone(),
            input_properties: execution.input_properties.clone(),
            declared_outputs: execution.declared_outputs.clone(),
            input_files,
            output_files,
            discovered_inputs,
        })
    }

    /// Ids of the stored fingerprints holding tree references.
    pub(crate) fn fingerprint_ids(&self) -> Vec<u64> {
        self.input_files
            .values()
            .chain(self.output_files.values())
            .chain(std::iter::once(&self.discovered_inputs))
            .filter_map(StoredFingerprint::id)
            .collect()
    }
}
