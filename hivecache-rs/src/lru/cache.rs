//! Provides the thread-safe cache each group uses as its local store.
//!
//! A [Cache](Cache) is a thin mutex-guarded façade around an [LruStore](crate::lru::LruStore)
//! of [ByteView](crate::byteview::ByteView) values. The store itself is created lazily on the
//! first write: a group which never sees a successful origin load therefore never allocates a
//! store, and pure-miss reads stay allocation free.
//!
//! Note that the mutex is exclusive even for reads, as every lookup mutates the recency order
//! of the underlying store. The lock is only ever held for the duration of a single map
//! operation and never across origin or peer calls.
use crate::byteview::ByteView;
use crate::lru::LruStore;
use std::sync::Mutex;

/// Describes the current state of a [Cache](Cache) for diagnostic purposes.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    /// Contains the number of entries currently stored.
    pub entries: usize,

    /// Contains the memory in bytes currently allocated by keys and values.
    pub allocated_memory: usize,

    /// Contains the configured memory budget in bytes (0 = unbounded).
    pub max_memory: usize,

    /// Contains the total number of lookups.
    pub reads: usize,

    /// Contains the total number of writes.
    pub writes: usize,

    /// Contains the percentage of lookups which hit an entry.
    pub hit_rate: f32,
}

struct Inner {
    max_memory: usize,
    store: Option<LruStore<ByteView>>,
}

/// A mutex-guarded, lazily initialized LRU store for cached values.
///
/// # Example
/// ```
/// # use hivecache::lru::Cache;
/// # use hivecache::byteview::ByteView;
/// let cache = Cache::new(1024);
///
/// // A read on a fresh cache neither allocates a store nor finds anything...
/// assert_eq!(cache.get("answer"), None);
///
/// cache.add("answer", ByteView::from("42"));
/// assert_eq!(cache.get("answer").unwrap().to_string(), "42");
/// ```
pub struct Cache {
    inner: Mutex<Inner>,
}

impl Cache {
    /// Creates a new cache enforcing the given memory budget in bytes (0 = unbounded).
    pub fn new(max_memory: usize) -> Self {
        Cache {
            inner: Mutex::new(Inner {
                max_memory,
                store: None,
            }),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// The first write creates the underlying store.
    pub fn add(&self, key: &str, value: ByteView) {
        let mut inner = self.inner.lock().unwrap();
        let max_memory = inner.max_memory;
        inner
            .store
            .get_or_insert_with(|| LruStore::new(max_memory))
            .put(key.to_owned(), value);
    }

    /// Performs a lookup for the given key.
    ///
    /// A hit refreshes the recency of the entry. Returns a cheap clone of the stored view.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut inner = self.inner.lock().unwrap();
        match inner.store.as_mut() {
            Some(store) => store.get(key).cloned(),
            None => None,
        }
    }

    /// Returns the number of entries currently stored.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.store.as_ref().map(LruStore::len).unwrap_or(0)
    }

    /// Determines if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Changes the memory budget of the cache.
    ///
    /// Shrinking the budget below the currently allocated memory immediately evicts entries.
    pub fn set_max_memory(&self, max_memory: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_memory = max_memory;
        if let Some(store) = inner.store.as_mut() {
            store.set_max_memory(max_memory);
        }
    }

    /// Reports the current state of the cache.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        match inner.store.as_ref() {
            Some(store) => CacheStats {
                entries: store.len(),
                allocated_memory: store.allocated_memory(),
                max_memory: store.max_memory(),
                reads: store.reads(),
                writes: store.writes(),
                hit_rate: store.hit_rate(),
            },
            None => CacheStats {
                max_memory: inner.max_memory,
                ..CacheStats::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::byteview::ByteView;
    use crate::lru::Cache;

    #[test]
    fn the_store_is_created_lazily() {
        let cache = Cache::new(1024);

        // Reads on a fresh cache do not create the store...
        assert_eq!(cache.get("key"), None);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().reads, 0);

        // ...the first write does.
        cache.add("key", ByteView::from("value"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("key").unwrap().as_slice(), b"value");
        assert_eq!(cache.stats().reads, 1);
        assert_eq!(cache.stats().writes, 1);
    }

    #[test]
    fn the_budget_is_passed_to_the_store() {
        let cache = Cache::new(10);

        cache.add("k1", ByteView::from("v1"));
        cache.add("k2", ByteView::from("v2"));
        cache.add("k3", ByteView::from("v3"));

        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn resizing_works_before_and_after_the_first_write() {
        let cache = Cache::new(0);

        // Resizing before the first write only records the new budget...
        cache.set_max_memory(10);
        assert_eq!(cache.stats().max_memory, 10);

        cache.add("k1", ByteView::from("v1"));
        cache.add("k2", ByteView::from("v2"));
        assert_eq!(cache.len(), 2);

        // ...resizing afterwards evicts immediately.
        cache.set_max_memory(4);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k2").unwrap().as_slice(), b"v2");
    }
}
