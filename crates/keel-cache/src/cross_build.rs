use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_vfs::ProducerGuard;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::error::CacheError;
use crate::store::{PersistentStore, StoreGeneration};

/// Counters of one [`CrossBuildCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub memory_hits: u64,
    pub store_hits: u64,
    pub misses: u64,
    /// Times the in-memory tier was dropped because of a foreign write.
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    store_hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

struct MemoryTier<K: Hash + Eq, V> {
    /// Store generation the entries were loaded under; `None` until first use.
    generation: Option<StoreGeneration>,
    /// Bumped by every write through this cache. A value loaded from the
    /// store is only kept in memory if no write happened while it loaded.
    write_epoch: u64,
    entries: LruCache<K, V>,
}

/// A two-tier cache: a bounded in-memory LRU over a [`PersistentStore`].
///
/// Before every access the store is asked whether another process wrote to
/// it; if so the whole in-memory tier is dropped first. Persistent failures
/// are logged and treated as misses, except through the `try_` methods.
pub struct CrossBuildCache<K: Hash + Eq, V> {
    namespace: &'static str,
    store: Arc<dyn PersistentStore>,
    memory: Mutex<MemoryTier<K, V>>,
    producers: ProducerGuard<K>,
    counters: Counters,
    _value: PhantomData<fn() -> V>,
}

impl<K, V> CrossBuildCache<K, V>
where
    K: Hash + Eq + Clone + Serialize,
    V: Clone + Serialize + DeserializeOwned,
{
    /// `namespace` separates caches sharing one store. The in-memory tier
    /// holds at most `capacity` entries, fewer if the store asks for it.
    pub fn new(namespace: &'static str, store: Arc<dyn PersistentStore>, capacity: NonZeroUsize) -> Self {
        let capacity = store
            .capacity_hint()
            .and_then(NonZeroUsize::new)
            .map_or(capacity, |hint| hint.min(capacity));
        Self {
            namespace,
            store,
            memory: Mutex::new(MemoryTier {
                generation: None,
                write_epoch: 0,
                entries: LruCache::new(capacity),
            }),
            producers: ProducerGuard::new(),
            counters: Counters::default(),
            _value: PhantomData,
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let observed = {
            let mut memory = self.synchronized_memory();
            if let Some(value) = memory.entries.get(key) {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Some(value.clone());
            }
            (memory.generation, memory.write_epoch)
        };
        let Some(value) = self.load(key) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.counters.store_hits.fetch_add(1, Ordering::Relaxed);
        let mut memory = self.synchronized_memory();
        if let Some(newer) = memory.entries.get(key) {
            return Some(newer.clone());
        }
        if (memory.generation, memory.write_epoch) == observed {
            memory.entries.put(key.clone(), value.clone());
        }
        Some(value)
    }

    /// Stores `value`; a failed persistent write is logged and only the
    /// in-memory tier is updated.
    pub fn put(&self, key: K, value: V) {
        let mut memory = self.synchronized_memory();
        if let Err(err) = self.persist(&key, Some(&value)) {
            self.log_write_failure(&err);
        }
        memory.write_epoch += 1;
        memory.entries.put(key, value);
    }

    /// Like [`Self::put`], but a failed persistent write is returned and
    /// leaves the in-memory tier untouched.
    pub fn try_put(&self, key: K, value: V) -> Result<(), CacheError> {
        let mut memory = self.synchronized_memory();
        memory.write_epoch += 1;
        self.persist(&key, Some(&value))?;
        memory.entries.put(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &K) {
        let mut memory = self.synchronized_memory();
        memory.write_epoch += 1;
        memory.entries.pop(key);
        if let Err(err) = self.persist(key, None) {
            self.log_write_failure(&err);
        }
    }

    pub fn try_remove(&self, key: &K) -> Result<(), CacheError> {
        let mut memory = self.synchronized_memory();
        memory.write_epoch += 1;
        memory.entries.pop(key);
        self.persist(key, None)
    }

    /// Returns the cached value for `key`, computing and storing it if absent.
    /// Concurrent callers for one key wait for a single computation.
    pub fn get_or_compute<E>(&self, key: &K, compute: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        self.producers.guard_by_key(key, || {
            if let Some(value) = self.peek_memory(key) {
                return Ok(value);
            }
            let value = compute()?;
            self.put(key.clone(), value.clone());
            Ok(value)
        })
    }

    /// Drops the in-memory tier without touching the store.
    pub fn clear_memory(&self) {
        self.memory.lock().entries.clear();
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().entries.len()
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            store_hits: self.counters.store_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    fn peek_memory(&self, key: &K) -> Option<V> {
        self.synchronized_memory().entries.get(key).cloned()
    }

    /// Locks the in-memory tier, first dropping it if the store generation
    /// moved since it was filled.
    fn synchronized_memory(&self) -> parking_lot::MutexGuard<'_, MemoryTier<K, V>> {
        let mut memory = self.memory.lock();
        let current = match self.store.generation() {
            Ok(generation) => Some(generation),
            Err(err) => {
                tracing::debug!(
                    target = "keel.cache",
                    namespace = self.namespace,
                    error = %err,
                    "failed to read store generation; dropping in-memory tier"
                );
                None
            }
        };
        if current.is_none() || memory.generation != current {
            if memory.generation.is_some() && !memory.entries.is_empty() {
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target = "keel.cache",
                    namespace = self.namespace,
                    entries = memory.entries.len(),
                    "store changed by another process; dropping in-memory tier"
                );
            }
            memory.entries.clear();
            memory.generation = current;
        }
        memory
    }

    fn store_key(&self, key: &K) -> Result<Vec<u8>, CacheError> {
        codec::encode(&(self.namespace, key))
    }

    fn load(&self, key: &K) -> Option<V> {
        let loaded = self
            .store_key(key)
            .and_then(|store_key| self.store.get(&store_key));
        let bytes = match loaded {
            Ok(bytes) => bytes?,
            Err(err) => {
                tracing::debug!(
                    target = "keel.cache",
                    namespace = self.namespace,
                    error = %err,
                    "cache read failed; treating as miss"
                );
                return None;
            }
        };
        match codec::decode(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(
                    target = "keel.cache",
                    namespace = self.namespace,
                    error = %err,
                    "corrupt cache entry; treating as miss"
                );
                None
            }
        }
    }

    fn persist(&self, key: &K, value: Option<&V>) -> Result<(), CacheError> {
        let store_key = self.store_key(key)?;
        match value {
            Some(value) => self.store.put(&store_key, &codec::encode(value)?),
            None => self.store.remove(&store_key),
        }
    }

    fn log_write_failure(&self, err: &CacheError) {
        tracing::debug!(
            target = "keel.cache",
            namespace = self.namespace,
            error = %err,
            "cache write failed"
        );
    }
}

impl<K: Hash + Eq, V> fmt::Debug for CrossBuildCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossBuildCache")
            .field("namespace", &self.namespace)
            .field("memory_len", &self.memory.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn store_hits_refill_memory() {
        let store = Arc::new(InMemoryStore::new());
        let first: CrossBuildCache<String, u64> = CrossBuildCache::new("n", store.clone(), capacity(8));
        first.put("a".into(), 1);

        let second: CrossBuildCache<String, u64> = CrossBuildCache::new("n", store, capacity(8));
        assert_eq!(second.get(&"a".into()), Some(1));
        assert_eq!(second.get(&"a".into()), Some(1));
        assert_eq!(
            second.statistics(),
            CacheStatistics {
                memory_hits: 1,
                store_hits: 1,
                ..CacheStatistics::default()
            }
        );
    }

    #[test]
    fn namespaces_do_not_collide() {
        let store: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let a: CrossBuildCache<u32, u32> = CrossBuildCache::new("a", Arc::clone(&store), capacity(4));
        let b: CrossBuildCache<u32, u32> = CrossBuildCache::new("b", store, capacity(4));
        a.put(1, 10);
        assert_eq!(b.get(&1), None);
    }

    #[test]
    fn memory_tier_is_bounded() {
        let store = Arc::new(InMemoryStore::new());
        let cache: CrossBuildCache<u32, u32> = CrossBuildCache::new("n", store.clone(), capacity(2));
        for i in 0..5 {
            cache.put(i, i);
        }
        assert_eq!(cache.memory_len(), 2);
        assert_eq!(store.len(), 5);
        assert_eq!(cache.get(&0), Some(0));
    }

    #[test]
    fn capacity_hint_lowers_the_memory_bound() {
        let store = Arc::new(InMemoryStore::new().with_capacity_hint(1));
        let cache: CrossBuildCache<u32, u32> = CrossBuildCache::new("n", store, capacity(100));
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.memory_len(), 1);
    }

    #[test]
    fn concurrent_get_or_compute_runs_once() {
        let store = Arc::new(InMemoryStore::new());
        let cache: Arc<CrossBuildCache<String, u64>> =
            Arc::new(CrossBuildCache::new("n", store, capacity(8)));
        let computed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let computed = Arc::clone(&computed);
                std::thread::spawn(move || {
                    cache
                        .get_or_compute(&"key".to_owned(), || {
                            computed.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok::<_, ()>(42)
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_computations_are_not_cached() {
        let cache: CrossBuildCache<u32, u32> =
            CrossBuildCache::new("n", Arc::new(InMemoryStore::new()), capacity(4));
        assert_eq!(cache.get_or_compute(&1, || Err("boom")), Err("boom"));
        assert_eq!(cache.get_or_compute(&1, || Ok::<_, &str>(5)), Ok(5));
    }
}
