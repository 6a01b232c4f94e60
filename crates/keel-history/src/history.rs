use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use keel_cache::{CrossBuildCache, PersistentStore};
use keel_fingerprint::FileCollectionFingerprint;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::{StoredFingerprint, TaskExecution, TaskExecutionRecord};
use crate::trees::TreeSnapshotRepository;
use crate::value::{ImplementationSnapshot, ValueSnapshot};

pub const DEFAULT_MAX_HISTORY: usize = 3;

/// The most recent executions of one task, newest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskHistory {
    executions: Vec<Arc<TaskExecutionRecord>>,
}

impl TaskHistory {
    pub fn executions(&self) -> &[Arc<TaskExecutionRecord>] {
        &self.executions
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Inserts `record` as the most recent execution and returns the
    /// executions evicted to keep at most `max` of them.
    pub fn push(&mut self, record: Arc<TaskExecutionRecord>, max: usize) -> Vec<Arc<TaskExecutionRecord>> {
        self.executions.insert(0, record);
        let keep = max.max(1);
        if self.executions.len() > keep {
            self.executions.split_off(keep)
        } else {
            Vec::new()
        }
    }

    /// Index of the execution whose declared outputs overlap most with
    /// `outputs`.
    ///
    /// An execution that declared no outputs matches only when `outputs` is
    /// empty too; otherwise at least one shared path is required. Ties go to
    /// the most recent execution.
    pub fn best_previous_index(&self, outputs: &BTreeSet<String>) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, execution) in self.executions.iter().enumerate() {
            let recorded = &execution.declared_outputs;
            let score = if recorded.is_empty() {
                if !outputs.is_empty() {
                    continue;
                }
                0
            } else {
                let overlap = recorded.intersection(outputs).count();
                if overlap == 0 {
                    continue;
                }
                overlap
            };
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((index, score)),
            }
        }
        best.map(|(index, _)| index)
    }
}

/// Persisted execution histories, keyed by task path.
pub struct TaskHistoryRepository {
    histories: CrossBuildCache<String, TaskHistory>,
    trees: Arc<TreeSnapshotRepository>,
    max_history: usize,
    /// Serializes read-modify-write of histories.
    lock: Mutex<()>,
}

impl TaskHistoryRepository {
    pub fn new(store: Arc<dyn PersistentStore>, capacity: NonZeroUsize, max_history: usize) -> Self {
        let trees = Arc::new(TreeSnapshotRepository::new(Arc::clone(&store), capacity));
        Self {
            histories: CrossBuildCache::new("task-history", store, capacity),
            trees,
            max_history: max_history.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn trees(&self) -> &Arc<TreeSnapshotRepository> {
        &self.trees
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn history(&self, task: &str) -> TaskHistory {
        self.histories.get(&task.to_owned()).unwrap_or_default()
    }

    /// Persists `execution` as the most recent execution of `task`. Tree
    /// references held by evicted executions are released.
    pub fn record_execution(&self, task: &str, execution: &TaskExecution) -> Result<()> {
        let record = Arc::new(TaskExecutionRecord::store(execution, &self.trees)?);
        let written = {
            let _guard = self.lock.lock();
            let mut history = self.history(task);
            let evicted = history.push(Arc::clone(&record), self.max_history);
            self.histories
                .try_put(task.to_owned(), history)
                .map(|()| evicted)
        };
        let evicted = match written {
            Ok(evicted) => evicted,
            Err(err) => {
                self.trees.release_after_failure(&record.fingerprint_ids());
                return Err(err.into());
            }
        };
        for record in &evicted {
            self.release(record)?;
        }
        tracing::debug!(
            target = "keel.history",
            task,
            build_id = %execution.build_id,
            evicted = evicted.len(),
            "recorded task execution"
        );
        Ok(())
    }

    /// The most recent execution of `task`.
    pub fn previous_execution(&self, task: &str) -> Option<HistoricalExecution> {
        let history = self.history(task);
        let record = history.executions.first()?;
        Some(HistoricalExecution::new(Arc::clone(record), Arc::clone(&self.trees)))
    }

    /// The recorded execution of `task` that best matches the currently
    /// declared `outputs`; see [`TaskHistory::best_previous_index`].
    pub fn best_previous_execution(
        &self,
        task: &str,
        outputs: &BTreeSet<String>,
    ) -> Option<HistoricalExecution> {
        let history = self.history(task);
        let index = history.best_previous_index(outputs)?;
        let record = Arc::clone(&history.executions[index]);
        Some(HistoricalExecution::new(record, Arc::clone(&self.trees)))
    }

    /// Forgets every execution of `task`.
    pub fn remove(&self, task: &str) -> Result<()> {
        let removed = {
            let _guard = self.lock.lock();
            let history = self.history(task);
            self.histories.try_remove(&task.to_owned())?;
            history.executions
        };
        for record in &removed {
            self.release(record)?;
        }
        Ok(())
    }

    fn release(&self, record: &TaskExecutionRecord) -> Result<()> {
        for id in record.fingerprint_ids() {
            self.trees.release(id)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskHistoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHistoryRepository")
            .field("max_history", &self.max_history)
            .finish_non_exhaustive()
    }
}

/// A recorded execution whose fingerprints are loaded on first use.
#[derive(Clone)]
pub struct HistoricalExecution {
    record: Arc<TaskExecutionRecord>,
    trees: Arc<TreeSnapshotRepository>,
    input_files: Arc<OnceLock<BTreeMap<String, FileCollectionFingerprint>>>,
    output_files: Arc<OnceLock<BTreeMap<String, FileCollectionFingerprint>>>,
}

impl HistoricalExecution {
    fn new(record: Arc<TaskExecutionRecord>, trees: Arc<TreeSnapshotRepository>) -> Self {
        Self {
            record,
            trees,
            input_files: Arc::new(OnceLock::new()),
            output_files: Arc::new(OnceLock::new()),
        }
    }

    pub fn record(&self) -> &TaskExecutionRecord {
        &self.record
    }

    pub fn build_id(&self) -> &str {
        &self.record.build_id
    }

    pub fn successful(&self) -> bool {
        self.record.successful
    }

    pub fn task_implementation(&self) -> &ImplementationSnapshot {
        &self.record.task_implementation
    }

    pub fn action_implementations(&self) -> &[ImplementationSnapshot] {
        &self.record.action_implementations
    }

    pub fn input_properties(&self) -> &BTreeMap<String, ValueSnapshot> {
        &self.record.input_properties
    }

    pub fn declared_outputs(&self) -> &BTreeSet<String> {
        &self.record.declared_outputs
    }

    /// Whether outputs of this execution may be considered up to date at
    /// all: it succeeded and every implementation is known.
    pub fn can_be_reused(&self) -> bool {
        self.record.successful
            && !self.record.task_implementation.is_unknown()
            && !self
                .record
                .action_implementations
                .iter()
                .any(ImplementationSnapshot::is_unknown)
    }

    pub fn input_files(&self) -> Result<&BTreeMap<String, FileCollectionFingerprint>> {
        load_all(&self.input_files, &self.record.input_files, &self.trees)
    }

    pub fn output_files(&self) -> Result<&BTreeMap<String, FileCollectionFingerprint>> {
        load_all(&self.output_files, &self.record.output_files, &self.trees)
    }

    pub fn discovered_inputs(&self) -> Result<FileCollectionFingerprint> {
        self.record.discovered_inputs.load(&self.trees)
    }
}

fn load_all<'a>(
    cell: &'a OnceLock<BTreeMap<String, FileCollectionFingerprint>>,
    stored: &BTreeMap<String, StoredFingerprint>,
    trees: &TreeSnapshotRepository,
) -> Result<&'a BTreeMap<String, FileCollectionFingerprint>> {
    if let Some(loaded) = cell.get() {
        return Ok(loaded);
    }
    let loaded = stored
        .iter()
        .map(|(property, fingerprint)| -> Result<(String, FileCollectionFingerprint)> {
            Ok((property.clone(), fingerprint.load(trees)?))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(cell.get_or_init(|| loaded))
}

impl std::fmt::Debug for HistoricalExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalExecution")
            .field("build_id", &self.record.build_id)
            .field("successful", &self.record.successful)
            .field("declared_outputs", &self.record.declared_outputs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::HashCode;

    fn record(outputs: &[&str]) -> Arc<TaskExecutionRecord> {
        let mut execution = TaskExecution::new(
            "build",
            ImplementationSnapshot::new("Task", HashCode::from_bytes("module")),
        );
        execution.declared_outputs = outputs.iter().map(|output| output.to_string()).collect();
        let trees = TreeSnapshotRepository::new(
            Arc::new(keel_cache::InMemoryStore::new()),
            NonZeroUsize::new(4).unwrap(),
        );
        Arc::new(TaskExecutionRecord::store(&execution, &trees).unwrap())
    }

    fn outputs(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|path| path.to_string()).collect()
    }

    fn history(records: Vec<Arc<TaskExecutionRecord>>) -> TaskHistory {
        TaskHistory { executions: records }
    }

    #[test]
    fn largest_overlap_wins() {
        let history = history(vec![record(&["a", "b"]), record(&["a"]), record(&[])]);
        assert_eq!(history.best_previous_index(&outputs(&["a", "b", "c"])), Some(0));
    }

    #[test]
    fn ties_favor_the_most_recent() {
        let history = history(vec![record(&["x", "a"]), record(&["a", "y"])]);
        assert_eq!(history.best_previous_index(&outputs(&["a"])), Some(0));
    }

    #[test]
    fn empty_outputs_only_match_empty_outputs() {
        let history = history(vec![record(&["a"]), record(&[])]);
        assert_eq!(history.best_previous_index(&outputs(&[])), Some(1));
        assert_eq!(history.best_previous_index(&outputs(&["b"])), None);
    }

    #[test]
    fn push_evicts_the_oldest() {
        let mut history = TaskHistory::default();
        for _ in 0..3 {
            assert!(history.push(record(&[]), 3).is_empty());
        }
        let newest = record(&["new"]);
        let evicted = history.push(Arc::clone(&newest), 3);
        assert_eq!(evicted.len(), 1);
        assert_eq!(history.len(), 3);
        assert!(Arc::ptr_eq(&history.executions()[0], &newest));
    }
}
