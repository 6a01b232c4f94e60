use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Token describing what a store handle has observed of other writers.
///
/// It changes whenever the handle notices that the store was written by
/// someone else (another process, or another handle in tests) since it last
/// looked. Writes made through the handle itself do not change it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreGeneration(u64);

impl StoreGeneration {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A persistent, cross-process key/value store.
///
/// Reads must observe a value atomically (the old one or the new one).
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Checks for foreign writes and returns the resulting generation.
    fn generation(&self) -> Result<StoreGeneration>;

    /// How many entries the store would like callers to keep in memory, if
    /// it has an opinion.
    fn capacity_hint(&self) -> Option<usize>;
}

/// Per-handle bookkeeping shared by the store implementations: compares the
/// store's write sequence against the last one this handle saw or produced.
#[derive(Debug, Default)]
pub(crate) struct WriteTracker {
    last_seen: u64,
    generation: u64,
}

impl WriteTracker {
    pub(crate) fn starting_at(sequence: u64) -> Self {
        Self {
            last_seen: sequence,
            generation: 0,
        }
    }

    /// Records the store's current sequence; a mismatch means a foreign write.
    pub(crate) fn observe(&mut self, sequence: u64) -> StoreGeneration {
        if sequence != self.last_seen {
            tracing::debug!(
                target = "keel.cache",
                last_seen = self.last_seen,
                sequence,
                "store modified by another writer"
            );
            self.last_seen = sequence;
            self.generation += 1;
        }
        StoreGeneration(self.generation)
    }

    /// Records a write through this handle that moved the sequence to
    /// `sequence`.
    pub(crate) fn wrote(&mut self, sequence: u64) {
        self.last_seen = sequence;
    }
}

#[derive(Debug, Default)]
struct SharedMap {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    sequence: u64,
}

/// An in-memory [`PersistentStore`].
///
/// [`InMemoryStore::connect`] opens another handle onto the same data, which
/// behaves like a second process writing to a shared cache directory.
#[derive(Debug)]
pub struct InMemoryStore {
    shared: Arc<Mutex<SharedMap>>,
    tracker: Mutex<WriteTracker>,
    capacity_hint: Option<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            tracker: Mutex::new(WriteTracker::default()),
            capacity_hint: None,
        }
    }

    pub fn with_capacity_hint(mut self, capacity_hint: usize) -> Self {
        self.capacity_hint = Some(capacity_hint);
        self
    }

    /// A new handle onto the same entries.
    pub fn connect(&self) -> Self {
        let sequence = self.shared.lock().sequence;
        Self {
            shared: Arc::clone(&self.shared),
            tracker: Mutex::new(WriteTracker::starting_at(sequence)),
            capacity_hint: self.capacity_hint,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, apply: impl FnOnce(&mut HashMap<Vec<u8>, Vec<u8>>)) {
        let mut shared = self.shared.lock();
        let mut tracker = self.tracker.lock();
        tracker.observe(shared.sequence);
        apply(&mut shared.entries);
        shared.sequence += 1;
        tracker.wrote(shared.sequence);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.shared.lock().entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(|entries| {
            entries.insert(key.to_vec(), value.to_vec());
        });
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.write(|entries| {
            entries.remove(key);
        });
        Ok(())
    }

    fn generation(&self) -> Result<StoreGeneration> {
        let sequence = self.shared.lock().sequence;
        Ok(self.tracker.lock().observe(sequence))
    }

    fn capacity_hint(&self) -> Option<usize> {
        self.capacity_hint
    }
}
