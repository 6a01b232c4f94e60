use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use keel_cache::{CrossBuildCache, PersistentStore};
use keel_core::{DirectoryTreeSnapshot, Snapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTree {
    root: Snapshot,
    descendants: Vec<Snapshot>,
}

/// Persisted, deduplicated storage of shareable directory tree snapshots.
///
/// Trees are stored once under their assigned id and reference counted
/// through a two-way index between fingerprint ids and tree ids. A tree is
/// deleted when the last fingerprint referencing it is released.
pub struct TreeSnapshotRepository {
    trees: CrossBuildCache<u64, StoredTree>,
    trees_of_fingerprint: CrossBuildCache<u64, BTreeSet<u64>>,
    fingerprints_of_tree: CrossBuildCache<u64, BTreeSet<u64>>,
    counters: CrossBuildCache<String, u64>,
    /// Serializes index updates and id allocation.
    lock: Mutex<()>,
    loaded: Mutex<HashMap<u64, Arc<DirectoryTreeSnapshot>>>,
}

const NEXT_ID: &str = "next-id";

impl TreeSnapshotRepository {
    pub fn new(store: Arc<dyn PersistentStore>, capacity: NonZeroUsize) -> Self {
        Self {
            trees: CrossBuildCache::new("tree-snapshots", Arc::clone(&store), capacity),
            trees_of_fingerprint: CrossBuildCache::new(
                "fingerprint-trees",
                Arc::clone(&store),
                capacity,
            ),
            fingerprints_of_tree: CrossBuildCache::new(
                "tree-fingerprints",
                Arc::clone(&store),
                capacity,
            ),
            counters: CrossBuildCache::new("tree-counters", store, NonZeroUsize::MIN),
            lock: Mutex::new(()),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh id, shared between trees and fingerprints.
    pub fn next_id(&self) -> Result<u64> {
        let _guard = self.lock.lock();
        self.allocate_id()
    }

    fn allocate_id(&self) -> Result<u64> {
        let key = NEXT_ID.to_owned();
        let id = self.counters.get(&key).unwrap_or(1);
        self.counters.try_put(key, id + 1)?;
        Ok(id)
    }

    /// Stores the shareable `trees` (at most once each) and records that
    /// `fingerprint_id` references them.
    pub fn store_references(
        &self,
        fingerprint_id: u64,
        trees: &[Arc<DirectoryTreeSnapshot>],
    ) -> Result<BTreeSet<u64>> {
        let _guard = self.lock.lock();
        let mut ids = BTreeSet::new();
        for tree in trees {
            ids.insert(self.store_tree(tree)?);
        }
        // The forward index goes first so that `release` can undo a
        // partially recorded reference set.
        let mut referenced = self.trees_of_fingerprint.get(&fingerprint_id).unwrap_or_default();
        referenced.extend(ids.iter().copied());
        self.trees_of_fingerprint.try_put(fingerprint_id, referenced)?;
        for id in &ids {
            let mut referrers = self.fingerprints_of_tree.get(id).unwrap_or_default();
            referrers.insert(fingerprint_id);
            self.fingerprints_of_tree.try_put(*id, referrers)?;
        }
        Ok(ids)
    }

    fn store_tree(&self, tree: &DirectoryTreeSnapshot) -> Result<u64> {
        let mut stored_now = false;
        let id = tree.assign_id_once(|| {
            let id = self.allocate_id()?;
            self.put_tree(id, tree)?;
            stored_now = true;
            Ok::<_, HistoryError>(id)
        })?;
        // An id assigned in an earlier build may belong to a tree that has
        // since been released and deleted.
        if !stored_now && self.trees.get(&id).is_none() {
            self.put_tree(id, tree)?;
        }
        Ok(id)
    }

    fn put_tree(&self, id: u64, tree: &DirectoryTreeSnapshot) -> Result<()> {
        tracing::trace!(
            target = "keel.history",
            id,
            root = tree.root_path(),
            entries = tree.len(),
            "storing tree snapshot"
        );
        self.trees.try_put(
            id,
            StoredTree {
                root: tree.root().clone(),
                descendants: tree.descendants().to_vec(),
            },
        )?;
        Ok(())
    }

    /// Drops every reference held by `fingerprint_id`, deleting trees nobody
    /// references anymore. Returns the deleted tree ids.
    pub fn release(&self, fingerprint_id: u64) -> Result<Vec<u64>> {
        let _guard = self.lock.lock();
        let Some(ids) = self.trees_of_fingerprint.get(&fingerprint_id) else {
            return Ok(Vec::new());
        };
        let mut deleted = Vec::new();
        for id in ids {
            let mut referrers = self.fingerprints_of_tree.get(&id).unwrap_or_default();
            referrers.remove(&fingerprint_id);
            if referrers.is_empty() {
                self.fingerprints_of_tree.try_remove(&id)?;
                self.trees.try_remove(&id)?;
                self.loaded.lock().remove(&id);
                deleted.push(id);
            } else {
                self.fingerprints_of_tree.try_put(id, referrers)?;
            }
        }
        self.trees_of_fingerprint.try_remove(&fingerprint_id)?;
        if !deleted.is_empty() {
            tracing::debug!(
                target = "keel.history",
                fingerprint_id,
                deleted = deleted.len(),
                "released tree snapshots"
            );
        }
        Ok(deleted)
    }

    /// Releases `fingerprint_ids` after a failed write, logging instead of
    /// returning further errors.
    pub(crate) fn release_after_failure(&self, fingerprint_ids: &[u64]) {
        for &fingerprint_id in fingerprint_ids {
            if let Err(err) = self.release(fingerprint_id) {
                tracing::warn!(
                    target = "keel.history",
                    fingerprint_id,
                    error = %err,
                    "failed to release tree references"
                );
            }
        }
    }

    pub fn reference_count(&self, tree_id: u64) -> usize {
        self.fingerprints_of_tree
            .get(&tree_id)
            .map_or(0, |referrers| referrers.len())
    }

    pub fn contains(&self, tree_id: u64) -> bool {
        self.trees.get(&tree_id).is_some()
    }

    /// Loads the tree stored under `id`. Loaded trees keep their id, so
    /// recording them again does not store a copy.
    pub fn load(&self, id: u64) -> Result<Arc<DirectoryTreeSnapshot>> {
        if let Some(tree) = self.loaded.lock().get(&id) {
            return Ok(Arc::clone(tree));
        }
        let stored = self
            .trees
            .get(&id)
            .ok_or(HistoryError::MissingTreeSnapshot { id })?;
        let tree = Arc::new(DirectoryTreeSnapshot::with_assigned_id(
            stored.root,
            stored.descendants,
            id,
        ));
        self.loaded.lock().insert(id, Arc::clone(&tree));
        Ok(tree)
    }
}

impl std::fmt::Debug for TreeSnapshotRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeSnapshotRepository")
            .field("loaded", &self.loaded.lock().len())
            .finish()
    }
}
