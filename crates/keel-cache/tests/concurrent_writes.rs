use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use keel_cache::{CrossBuildCache, InMemoryStore, PersistentStore, StoreGeneration};

/// Holds the next `get` after it has read its value until the test lets it
/// continue, so a write can land in between.
struct SlowReadStore {
    inner: InMemoryStore,
    hold_next_read: AtomicBool,
    read_done: Mutex<Sender<()>>,
    resume: Mutex<Receiver<()>>,
}

impl PersistentStore for SlowReadStore {
    fn get(&self, key: &[u8]) -> keel_cache::Result<Option<Vec<u8>>> {
        let value = self.inner.get(key)?;
        if self.hold_next_read.swap(false, Ordering::SeqCst) {
            self.read_done.lock().unwrap().send(()).unwrap();
            self.resume.lock().unwrap().recv().unwrap();
        }
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> keel_cache::Result<()> {
        self.inner.put(key, value)
    }

    fn remove(&self, key: &[u8]) -> keel_cache::Result<()> {
        self.inner.remove(key)
    }

    fn generation(&self) -> keel_cache::Result<StoreGeneration> {
        self.inner.generation()
    }

    fn capacity_hint(&self) -> Option<usize> {
        None
    }
}

/// Caches `value` in the store only, then starts a reader of it that is
/// held inside the store read. Sending on the returned channel lets it finish.
fn read_held_after_loading(
    value: u64,
) -> (
    Arc<CrossBuildCache<String, u64>>,
    Sender<()>,
    JoinHandle<Option<u64>>,
) {
    let (read_done_tx, read_done_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let store = Arc::new(SlowReadStore {
        inner: InMemoryStore::new(),
        hold_next_read: AtomicBool::new(false),
        read_done: Mutex::new(read_done_tx),
        resume: Mutex::new(resume_rx),
    });
    let cache: Arc<CrossBuildCache<String, u64>> = Arc::new(CrossBuildCache::new(
        "values",
        store.clone(),
        NonZeroUsize::new(16).unwrap(),
    ));
    cache.put("key".into(), value);
    cache.clear_memory();

    store.hold_next_read.store(true, Ordering::SeqCst);
    let reader = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || cache.get(&"key".into()))
    };
    read_done_rx.recv().unwrap();
    (cache, resume_tx, reader)
}

#[test]
fn write_during_a_store_read_is_not_overwritten_in_memory() {
    let (cache, resume, reader) = read_held_after_loading(1);
    cache.try_put("key".into(), 2).unwrap();
    resume.send(()).unwrap();

    // The reader may answer with either value, but must not cache the old one.
    let seen = reader.join().unwrap();
    assert!(matches!(seen, Some(1) | Some(2)), "{seen:?}");
    assert_eq!(cache.get(&"key".into()), Some(2));
}

#[test]
fn removal_during_a_store_read_is_not_undone_in_memory() {
    let (cache, resume, reader) = read_held_after_loading(1);
    cache.try_remove(&"key".into()).unwrap();
    resume.send(()).unwrap();

    reader.join().unwrap();
    assert_eq!(cache.get(&"key".into()), None);
}
