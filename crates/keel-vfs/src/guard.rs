use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Serializes work per key: at most one closure runs for a given key at any
/// time, while closures for distinct keys run in parallel.
///
/// Callers typically re-check a cache inside the closure, so threads that
/// waited for the first producer find its result instead of recomputing it.
pub struct ProducerGuard<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> ProducerGuard<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn guard_by_key<T>(&self, key: &K, produce: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let release = Release {
            guard: self,
            key,
            lock: Some(lock),
        };
        let result = {
            let _held = release.lock.as_ref().map(|lock| lock.lock());
            produce()
        };
        drop(release);
        result
    }

    /// Number of keys with a producer running or waiting.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

impl<K: Eq + Hash + Clone> Default for ProducerGuard<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for ProducerGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerGuard")
            .field("active_keys", &self.locks.lock().len())
            .finish()
    }
}

/// Drops the per-key lock entry once nobody else holds it, also on unwind.
struct Release<'a, K: Eq + Hash + Clone> {
    guard: &'a ProducerGuard<K>,
    key: &'a K,
    lock: Option<Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Drop for Release<'_, K> {
    fn drop(&mut self) {
        let mut locks = self.guard.locks.lock();
        // Other threads only clone the entry while holding the map lock, so the
        // count cannot grow between this check and the removal.
        drop(self.lock.take());
        if locks
            .get(self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn same_key_never_runs_concurrently() {
        let guard = Arc::new(ProducerGuard::<String>::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let running = Arc::clone(&running);
                let max_running = Arc::clone(&max_running);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    guard.guard_by_key(&"key".to_owned(), || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_running.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert_eq!(guard.active_keys(), 0);
    }

    #[test]
    fn distinct_keys_run_in_parallel() {
        let guard = Arc::new(ProducerGuard::<u32>::new());
        let barrier = Arc::new(Barrier::new(2));

        // Both closures wait on the same barrier; this only finishes if the two
        // keys are allowed to hold their guards at the same time.
        let handles: Vec<_> = (0..2)
            .map(|key| {
                let guard = Arc::clone(&guard);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || guard.guard_by_key(&key, || barrier.wait()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn entry_is_released_after_panic() {
        let guard = ProducerGuard::<u8>::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            guard.guard_by_key(&1, || panic!("boom"))
        }));
        assert!(result.is_err());
        assert_eq!(guard.active_keys(), 0);
        assert_eq!(guard.guard_by_key(&1, || 5), 5);
    }
}
