use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use keel_core::{FileKind, HashBuilder, HashCode};
use serde::{Deserialize, Serialize};

use crate::normalization::NormalizedSnapshot;

/// Entries of a fingerprint, keyed by absolute path, in fingerprint order.
pub type FingerprintEntries = IndexMap<Arc<str>, NormalizedSnapshot>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One difference between two fingerprints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub title: Arc<str>,
    pub path: Arc<str>,
    pub kind: ChangeKind,
    /// Kind of the file in the current fingerprint, or in the previous one
    /// for removals.
    pub file_kind: FileKind,
}

impl Change {
    fn added(title: &Arc<str>, entry: &NormalizedSnapshot) -> Self {
        Self::new(title, entry, ChangeKind::Added)
    }

    fn removed(title: &Arc<str>, entry: &NormalizedSnapshot) -> Self {
        Self::new(title, entry, ChangeKind::Removed)
    }

    fn modified(title: &Arc<str>, current: &NormalizedSnapshot) -> Self {
        Self::new(title, current, ChangeKind::Modified)
    }

    fn new(title: &Arc<str>, entry: &NormalizedSnapshot, kind: ChangeKind) -> Self {
        Self {
            title: Arc::clone(title),
            path: Arc::clone(entry.absolute_path()),
            kind,
            file_kind: entry.snapshot().kind(),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ChangeKind::Added => "has been added",
            ChangeKind::Removed => "has been removed",
            ChangeKind::Modified => "has changed",
        };
        write!(f, "{} file {} {}.", self.title, self.path, what)
    }
}

/// How two fingerprints are lined up against each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareStrategy {
    /// Position matters (classpaths).
    Ordered,
    /// Entries are matched by normalized path regardless of position.
    Unordered,
}

impl CompareStrategy {
    /// Feeds the changes from `previous` to `current` to `visitor`, stopping
    /// early when it returns `false`. Returns whether all changes were visited.
    pub fn visit_changes(
        self,
        current: &FingerprintEntries,
        previous: &FingerprintEntries,
        title: &Arc<str>,
        include_added: bool,
        visitor: &mut dyn FnMut(Change) -> bool,
    ) -> bool {
        if current.len() <= 1 && previous.len() <= 1 {
            return visit_trivial(current, previous, title, include_added, visitor);
        }
        self.visit_changes_general(current, previous, title, include_added, visitor)
    }

    /// The general algorithms, without the small-collection shortcut.
    pub fn visit_changes_general(
        self,
        current: &FingerprintEntries,
        previous: &FingerprintEntries,
        title: &Arc<str>,
        include_added: bool,
        visitor: &mut dyn FnMut(Change) -> bool,
    ) -> bool {
        match self {
            CompareStrategy::Ordered => visit_ordered(current, previous, title, include_added, visitor),
            CompareStrategy::Unordered => {
                visit_unordered(current, previous, title, include_added, visitor)
            }
        }
    }

    pub fn append_to_hash<'a>(
        self,
        hasher: &mut HashBuilder,
        entries: impl ExactSizeIterator<Item = &'a NormalizedSnapshot>,
    ) {
        hasher.put_u64(entries.len() as u64);
        match self {
            CompareStrategy::Ordered => {
                for entry in entries {
                    entry.append_to_hash(hasher);
                }
            }
            CompareStrategy::Unordered => {
                let mut sorted: Vec<_> = entries.collect();
                sorted.sort_by(|a, b| a.total_cmp(b));
                for entry in sorted {
                    entry.append_to_hash(hasher);
                }
            }
        }
    }
}

fn visit_trivial(
    current: &FingerprintEntries,
    previous: &FingerprintEntries,
    title: &Arc<str>,
    include_added: bool,
    visitor: &mut dyn FnMut(Change) -> bool,
) -> bool {
    match (current.values().next(), previous.values().next()) {
        (None, None) => true,
        (Some(current), None) => !include_added || visitor(Change::added(title, current)),
        (None, Some(previous)) => visitor(Change::removed(title, previous)),
        (Some(current), Some(previous)) => {
            if current.normalized_path() == previous.normalized_path() {
                if current.snapshot().is_content_up_to_date(previous.snapshot()) {
                    true
                } else {
                    visitor(Change::modified(title, current))
                }
            } else {
                visitor(Change::removed(title, previous))
                    && (!include_added || visitor(Change::added(title, current)))
            }
        }
    }
}

fn visit_ordered(
    current: &FingerprintEntries,
    previous: &FingerprintEntries,
    title: &Arc<str>,
    include_added: bool,
    visitor: &mut dyn FnMut(Change) -> bool,
) -> bool {
    let mut current_iter = current.values();
    let mut previous_iter = previous.values();
    loop {
        match (current_iter.next(), previous_iter.next()) {
            (Some(current), Some(previous)) => {
                if current.normalized_path() == previous.normalized_path() {
                    if !current.snapshot().is_content_up_to_date(previous.snapshot())
                        && !visitor(Change::modified(title, current))
                    {
                        return false;
                    }
                } else {
                    if !visitor(Change::removed(title, previous)) {
                        return false;
                    }
                    if include_added && !visitor(Change::added(title, current)) {
                        return false;
                    }
                }
            }
            (Some(current), None) => {
                if include_added && !visitor(Change::added(title, current)) {
                    return false;
                }
            }
            (None, Some(previous)) => {
                if !visitor(Change::removed(title, previous)) {
                    return false;
                }
            }
            (None, None) => return true,
        }
    }
}

/// Matches entries by normalized path and content first, so equal entries
/// pair up no matter where they sit. Unmatched previous entries are then
/// paired with unmatched current entries of the same normalized path, in
/// previous order, and reported as modified. What is left over was removed
/// or added.
fn visit_unordered(
    current: &FingerprintEntries,
    previous: &FingerprintEntries,
    title: &Arc<str>,
    include_added: bool,
    visitor: &mut dyn FnMut(Change) -> bool,
) -> bool {
    let previous: Vec<&NormalizedSnapshot> = previous.values().collect();
    let mut unmatched_previous: HashMap<(&str, HashCode), VecDeque<usize>> = HashMap::new();
    for (index, entry) in previous.iter().enumerate() {
        unmatched_previous
            .entry(content_key(entry))
            .or_default()
            .push_back(index);
    }

    let mut matched = vec![false; previous.len()];
    let mut tentatively_added: IndexMap<&str, VecDeque<&NormalizedSnapshot>> = IndexMap::new();
    for current_entry in current.values() {
        match unmatched_previous
            .get_mut(&content_key(current_entry))
            .and_then(VecDeque::pop_front)
        {
            Some(index) => matched[index] = true,
            None => tentatively_added
                .entry(current_entry.normalized_path())
                .or_default()
                .push_back(current_entry),
        }
    }

    let leftovers = previous
        .iter()
        .zip(&matched)
        .filter(|(_, matched)| !**matched)
        .map(|(entry, _)| *entry);
    for previous_entry in leftovers {
        let paired = tentatively_added
            .get_mut(previous_entry.normalized_path())
            .and_then(VecDeque::pop_front);
        let change = match paired {
            Some(added) => Change::modified(title, added),
            None => Change::removed(title, previous_entry),
        };
        if !visitor(change) {
            return false;
        }
    }

    if include_added {
        for added in tentatively_added.values().flatten() {
            if !visitor(Change::added(title, added)) {
                return false;
            }
        }
    }
    true
}

fn content_key(entry: &NormalizedSnapshot) -> (&str, HashCode) {
    (entry.normalized_path(), entry.snapshot().content_hash())
}
