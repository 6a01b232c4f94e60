use std::fmt;
use std::fs;
use std::io::{self, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::{self, PAYLOAD_LIMIT_BYTES};
use crate::error::{CacheError, Result};
use crate::lock::DirLock;
use crate::store::{PersistentStore, StoreGeneration, WriteTracker};

const LOCK_FILE: &str = "keel.lock";
const STATE_FILE: &str = "state.bin";
const ENTRIES_DIR: &str = "entries";

/// Contents of the state file: the write sequence and who wrote last.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct StoreState {
    sequence: u64,
    writer: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// A [`PersistentStore`] in a directory, safe to share between processes.
///
/// Layout:
/// - `keel.lock`: advisory lock serializing writers;
/// - `state.bin`: the write sequence, bumped by every put and remove;
/// - `entries/<sha256 of key>`: one file per entry, replaced atomically.
pub struct FileStore {
    dir: PathBuf,
    writer: u64,
    tracker: Mutex<WriteTracker>,
    capacity_hint: Option<usize>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(ENTRIES_DIR))?;
        let store = Self {
            writer: next_writer_id(),
            tracker: Mutex::new(WriteTracker::default()),
            capacity_hint: None,
            dir,
        };
        let state = store.read_state();
        *store.tracker.lock() = WriteTracker::starting_at(state.sequence);
        tracing::debug!(
            target = "keel.cache",
            dir = %store.dir.display(),
            writer = store.writer,
            sequence = state.sequence,
            "opened file store"
        );
        Ok(store)
    }

    pub fn with_capacity_hint(mut self, capacity_hint: usize) -> Self {
        self.capacity_hint = Some(capacity_hint);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &[u8]) -> PathBuf {
        let digest = Sha256::digest(key);
        self.dir.join(ENTRIES_DIR).join(hex::encode(digest))
    }

    /// The persisted state, or the zero state if it is missing or corrupt.
    fn read_state(&self) -> StoreState {
        let path = self.dir.join(STATE_FILE);
        match read_decoded(&path) {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                tracing::debug!(
                    target = "keel.cache",
                    path = %path.display(),
                    error = %err,
                    "ignoring unreadable store state"
                );
                StoreState::default()
            }
        }
    }

    /// Runs `apply` under the directory lock and bumps the write sequence.
    fn write(&self, apply: impl FnOnce() -> Result<()>) -> Result<()> {
        let _lock = DirLock::acquire(&self.dir.join(LOCK_FILE))?;
        let state = self.read_state();
        let mut tracker = self.tracker.lock();
        tracker.observe(state.sequence);

        let result = apply();
        let next = StoreState {
            sequence: state.sequence + 1,
            writer: self.writer,
        };
        // Bump even when `apply` failed halfway; other handles must not trust
        // what they remember about this key.
        replace_file(&self.dir.join(STATE_FILE), &codec::encode(&next)?)?;
        tracker.wrote(next.sequence);
        result
    }
}

impl PersistentStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        let entry: StoredEntry = match read_decoded(&path) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(err) => {
                discard_corrupt(&path);
                return Err(err);
            }
        };
        if entry.key != key {
            return Err(CacheError::KeyMismatch { path });
        }
        Ok(Some(entry.value))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        let bytes = codec::encode(&StoredEntry {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.write(|| replace_file(&path, &bytes))
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        self.write(|| match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        })
    }

    fn generation(&self) -> Result<StoreGeneration> {
        let state = self.read_state();
        Ok(self.tracker.lock().observe(state.sequence))
    }

    fn capacity_hint(&self) -> Option<usize> {
        self.capacity_hint
    }
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("dir", &self.dir)
            .field("writer", &self.writer)
            .finish()
    }
}

/// Unique per handle within a process, and very likely across processes.
fn next_writer_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let pid = u64::from(std::process::id());
    (pid << 32) | (COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff_ffff)
}

/// Reads a store file, `None` when it does not exist. Files larger than any
/// entry we write are reported as corrupt without reading them.
fn read_bounded(path: &Path) -> Result<Option<Vec<u8>>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut bytes = Vec::new();
    file.take(PAYLOAD_LIMIT_BYTES + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > PAYLOAD_LIMIT_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "store file exceeds the payload limit").into());
    }
    Ok(Some(bytes))
}

fn read_decoded<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match read_bounded(path)? {
        Some(bytes) => codec::decode(&bytes).map(Some),
        None => Ok(None),
    }
}

/// Replaces `path` so concurrent readers see the old or the new bytes, never a
/// prefix.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("store file has no parent directory"))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".keel-tmp-")
        .tempfile_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn discard_corrupt(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::debug!(
            target = "keel.cache",
            path = %path.display(),
            error = %err,
            "failed to discard corrupt store entry"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_round_trip_and_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(b"alpha", b"1").unwrap();
        store.put(b"beta", b"2").unwrap();
        store.remove(b"beta").unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(b"alpha").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(reopened.get(b"beta").unwrap(), None);
        assert_eq!(reopened.get(b"gamma").unwrap(), None);
    }

    #[test]
    fn corrupt_entries_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(b"key", b"value").unwrap();
        let path = store.entry_path(b"key");
        std::fs::write(&path, [0xff; 3]).unwrap();

        assert!(store.get(b"key").is_err());
        assert!(!path.exists());
        assert_eq!(store.get(b"key").unwrap(), None);
    }

    #[test]
    fn replacing_leaves_no_temporary_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(b"key", b"first").unwrap();
        store.put(b"key", b"second").unwrap();

        assert_eq!(store.get(b"key").unwrap().as_deref(), Some(&b"second"[..]));
        let entries = fs::read_dir(dir.path().join(ENTRIES_DIR)).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn a_second_handle_is_a_foreign_writer() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileStore::open(dir.path()).unwrap();
        let second = FileStore::open(dir.path()).unwrap();
        let initial = first.generation().unwrap();

        first.put(b"mine", b"1").unwrap();
        assert_eq!(first.generation().unwrap(), initial);

        second.put(b"theirs", b"2").unwrap();
        assert_ne!(first.generation().unwrap(), initial);
        assert_eq!(first.get(b"theirs").unwrap().as_deref(), Some(&b"2"[..]));
    }
}
