//! Deciding which files in an output location a task actually produced.
//!
//! Output directories may be shared between tasks, or contain files that
//! were there before the task ran. The heuristics here only look at the
//! fingerprints taken before and after the execution and after the previous
//! execution, so they are approximate when outputs overlap.

use std::fmt;

use keel_core::FileKind;
use keel_fingerprint::{
    CompareStrategy, FileCollectionFingerprint, FingerprintEntries, NormalizedSnapshot,
};

/// Keeps the entries of `after` the task is considered to own: entries
/// created or changed by the execution, and entries that were already
/// outputs after the previous execution. Missing entries are dropped.
///
/// Returns `after` itself when every entry qualifies, or when there is
/// nothing to compare against.
pub fn filter_output_fingerprint(
    after_previous: Option<&FileCollectionFingerprint>,
    before: &FileCollectionFingerprint,
    after: &FileCollectionFingerprint,
) -> FileCollectionFingerprint {
    if before.is_empty() || after.is_empty() {
        return after.clone();
    }
    let outputs: FingerprintEntries = after
        .entries()
        .iter()
        .filter(|(path, entry)| is_output_entry(path, entry, before, after_previous))
        .map(|(path, entry)| (path.clone(), entry.clone()))
        .collect();
    if outputs.len() == after.len() {
        return after.clone();
    }
    FileCollectionFingerprint::from_entries(after.strategy(), CompareStrategy::Unordered, outputs)
}

fn is_output_entry(
    path: &str,
    entry: &NormalizedSnapshot,
    before: &FileCollectionFingerprint,
    after_previous: Option<&FileCollectionFingerprint>,
) -> bool {
    if entry.snapshot().kind() == FileKind::Missing {
        return false;
    }
    let Some(previous) = before.entries().get(path) else {
        return true;
    };
    if !entry
        .snapshot()
        .is_content_and_metadata_up_to_date(previous.snapshot())
    {
        return true;
    }
    after_previous.is_some_and(|fingerprint| fingerprint.entries().contains_key(path))
}

/// A file found in an output location before the task ran that the task did
/// not leave there last time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlappingOutputs {
    pub property_name: String,
    pub path: String,
}

impl OverlappingOutputs {
    /// Looks for the first existing entry of `before` that is absent from,
    /// or has different content than, the outputs recorded after the
    /// previous execution.
    pub fn detect(
        property_name: &str,
        after_previous: Option<&FileCollectionFingerprint>,
        before: &FileCollectionFingerprint,
    ) -> Option<Self> {
        before.entries().iter().find_map(|(path, entry)| {
            if entry.snapshot().kind() == FileKind::Missing {
                return None;
            }
            let previous = after_previous.and_then(|fingerprint| fingerprint.entries().get(path));
            let overlapping = match previous {
                None => true,
                Some(previous) => !previous.snapshot().is_content_up_to_date(entry.snapshot()),
            };
            overlapping.then(|| OverlappingOutputs {
                property_name: property_name.to_owned(),
                path: path.to_string(),
            })
        })
    }
}

impl fmt::Display for OverlappingOutputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output property '{}' contains '{}', which was not produced by the previous execution",
            self.property_name, self.path
        )
    }
}
