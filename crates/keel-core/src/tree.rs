use crate::hash::{HashBuilder, HashCode};
use crate::snapshot::Snapshot;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Snapshot of a whole directory tree: the root plus every descendant in
/// pre-order, siblings sorted by name.
///
/// A tree produced by an unfiltered walk is *shareable*: task history stores it
/// once and references it by id from every fingerprint that contains it. The
/// id is assigned lazily, at most once, on first persistence.
pub struct DirectoryTreeSnapshot {
    root: Snapshot,
    descendants: Arc<[Snapshot]>,
    shareable: bool,
    assigned_id: Mutex<Option<u64>>,
}

impl DirectoryTreeSnapshot {
    pub fn new(root: Snapshot, descendants: Vec<Snapshot>, shareable: bool) -> Self {
        Self {
            root,
            descendants: descendants.into(),
            shareable,
            assigned_id: Mutex::new(None),
        }
    }

    /// A tree read back from the tree store under `id`.
    pub fn with_assigned_id(root: Snapshot, descendants: Vec<Snapshot>, id: u64) -> Self {
        Self {
            root,
            descendants: descendants.into(),
            shareable: true,
            assigned_id: Mutex::new(Some(id)),
        }
    }

    pub fn root(&self) -> &Snapshot {
        &self.root
    }

    pub fn root_path(&self) -> &str {
        self.root.path()
    }

    pub fn descendants(&self) -> &[Snapshot] {
        &self.descendants
    }

    /// The root followed by all descendants.
    pub fn entries(&self) -> impl Iterator<Item = &Snapshot> + '_ {
        std::iter::once(&self.root).chain(self.descendants.iter())
    }

    pub fn len(&self) -> usize {
        self.descendants.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn is_shareable(&self) -> bool {
        self.shareable
    }

    pub fn assigned_id(&self) -> Option<u64> {
        *self.assigned_id.lock()
    }

    /// Returns the tree's id, running `store` to allocate and persist it if no
    /// id has been assigned yet.
    ///
    /// The per-instance lock is held while `store` runs, so concurrent callers
    /// wait for the first one and all observe the same id. A failed `store`
    /// leaves the tree unassigned.
    pub fn assign_id_once<E>(&self, store: impl FnOnce() -> Result<u64, E>) -> Result<u64, E> {
        let mut slot = self.assigned_id.lock();
        if let Some(id) = *slot {
            return Ok(id);
        }
        let id = store()?;
        *slot = Some(id);
        Ok(id)
    }

    /// Aggregate hash of the tree: relative path and content of every entry.
    pub fn aggregate_hash(&self) -> HashCode {
        let root = self.root.path();
        let mut hasher = HashBuilder::new();
        hasher.put_u64(self.len() as u64);
        for entry in self.entries() {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            hasher.put_str(relative.trim_start_matches(['/', '\\']));
            hasher.put_hash(&entry.content_hash());
        }
        hasher.finish()
    }
}

impl fmt::Debug for DirectoryTreeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryTreeSnapshot")
            .field("root", &self.root.path())
            .field("descendants", &self.descendants.len())
            .field("shareable", &self.shareable)
            .field("assigned_id", &self.assigned_id())
            .finish()
    }
}
