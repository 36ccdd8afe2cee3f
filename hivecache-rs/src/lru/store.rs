use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    ///
    /// Note that most probably this is an approximation and not the exact byte value. However,
    /// it should represent the "largest" part of an instance (e.g. for a string, this would be
    /// the bytes allocated on the heap while discarding the length and capacity fields as well
    /// as the pointer itself).
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.len()
    }
}

/// Invoked with the key and value of each entry being evicted due to memory pressure.
///
/// Note that the callback runs while the owning lock is held, therefore it must not call back
/// into the store or its wrapper.
pub type EvictionCallback<V> = Box<dyn FnMut(&str, &V) + Send>;

/// Provides a size constrained LRU store.
///
/// The store behaves just like a **Map** as long as there is no shortage in storage. However,
/// once the memory allocated by its keys and values grows beyond **max_memory**, old (least
/// recently used) entries are evicted until the budget is honored again. A **max_memory** of
/// zero disables the bound entirely.
///
/// Every entry is accounted as the byte length of its key plus the
/// [allocated_size](ByteSize::allocated_size) of its value. Both a successful
/// [get](LruStore::get) and every [put](LruStore::put) mark the affected entry as the most
/// recently used one, so eviction always removes the entry which has been untouched the
/// longest.
///
/// The store itself is **not** thread-safe as even reads mutate the recency order. Concurrent
/// users have to serialize, which is what [Cache](crate::lru::Cache) does.
///
/// # Examples
/// ```
/// # use hivecache::lru::LruStore;
/// // Specifies a store which may allocate up to 20 bytes of memory...
/// let mut lru = LruStore::new(20);
///
/// lru.put("Foo".to_owned(), "Bar".to_owned());
/// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
///
/// // this will still fit..
/// lru.put("Foo1".to_owned(), "X".repeat(8));
/// assert_eq!(lru.get("Foo").is_some(), true);
/// assert_eq!(lru.get("Foo1").is_some(), true);
///
/// // this will exceed the memory budget...
/// lru.put("Foo2".to_owned(), "X".repeat(8));
/// // ..and therefore will throw the least recently used entries out:
/// assert_eq!(lru.get("Foo").is_some(), false);
/// assert_eq!(lru.get("Foo1").is_some(), false);
/// assert_eq!(lru.get("Foo2").is_some(), true);
/// ```
pub struct LruStore<V: ByteSize> {
    max_memory: usize,
    allocated_memory: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    map: LinkedHashMap<String, V>,
    on_evict: Option<EvictionCallback<V>>,
}

impl<V: ByteSize> LruStore<V> {
    /// Creates a new store which may allocate up to **max_memory** bytes for its keys and
    /// values.
    ///
    /// A **max_memory** of zero creates an unbounded store which never evicts.
    pub fn new(max_memory: usize) -> Self {
        LruStore {
            max_memory,
            allocated_memory: 0,
            reads: 0,
            hits: 0,
            writes: 0,
            map: LinkedHashMap::new(),
            on_evict: None,
        }
    }

    /// Installs a callback which is invoked for every entry evicted due to memory pressure.
    ///
    /// The callback fires while the caller of [put](LruStore::put) still holds whatever lock
    /// guards this store. It must therefore neither block nor call back into the store.
    pub fn set_eviction_callback(&mut self, callback: EvictionCallback<V>) {
        self.on_evict = Some(callback);
    }

    /// Stores the given value for the given key.
    ///
    /// The entry becomes the most recently used one. If the key was already present, its
    /// value is replaced and the memory accounting is adjusted by the size difference.
    ///
    /// Note that a value larger than the whole memory budget is admitted and then immediately
    /// evicted again by the budget enforcement, so the store simply ends up empty.
    ///
    /// # Examples
    /// ```
    /// # use hivecache::lru::LruStore;
    /// let mut lru = LruStore::new(1024);
    ///
    /// lru.put("Foo".to_owned(), "Bar".to_owned());
    /// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
    /// assert_eq!(lru.allocated_memory(), 6);
    /// ```
    pub fn put(&mut self, key: String, value: V) {
        let key_size = key.len();
        let entry_size = key_size + value.allocated_size();

        self.writes += 1;

        let mut delta = entry_size as isize;
        if let Some(previous) = self.map.insert(key, value) {
            // The key itself stays accounted, so replacing a value only shifts the
            // accounting by the difference of the value sizes...
            delta -= (key_size + previous.allocated_size()) as isize;
        }
        self.allocated_memory = (self.allocated_memory as isize + delta) as usize;

        self.enforce_limit();
    }

    /// Evicts entries from the cold end until the memory budget is honored again.
    ///
    /// This has to be a loop, as a single large insertion might require several small entries
    /// to be evicted.
    fn enforce_limit(&mut self) {
        while self.max_memory > 0 && self.allocated_memory > self.max_memory && !self.map.is_empty()
        {
            self.remove_oldest();
        }
    }

    /// Removes the least recently used entry.
    ///
    /// This is a no-op on an empty store. If an eviction callback is installed, it is invoked
    /// with the removed key and value.
    pub fn remove_oldest(&mut self) {
        if let Some((key, value)) = self.map.pop_front() {
            self.allocated_memory -= key.len() + value.allocated_size();
            if let Some(callback) = self.on_evict.as_mut() {
                callback(&key, &value);
            }
        }
    }

    /// Returns the value which has previously been stored for the given key or **None** if
    /// no value is present.
    ///
    /// A successful lookup marks the entry as the most recently used one (which is why even
    /// reads require mutable access).
    ///
    /// # Examples
    /// ```
    /// # use hivecache::lru::LruStore;
    /// let mut lru = LruStore::new(1024);
    ///
    /// lru.put("Foo".to_owned(), "Bar".to_owned());
    /// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
    /// assert_eq!(lru.get("Unknown"), None);
    /// ```
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;

        match self.map.get_refresh(key) {
            Some(value) => {
                self.hits += 1;
                Some(&*value)
            }
            None => None,
        }
    }

    /// Returns the number of entries in the store.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the amount of memory allocated by the keys and values of this store.
    ///
    /// The returned value is in bytes. Note that this is a rough estimate which accounts for
    /// the payload data but not for the internal hash map or other metadata.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Returns the maximal amount of memory to be (roughly) occupied by this store.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Specifies the maximal amount of memory to be (roughly) occupied by this store.
    ///
    /// Shrinking the budget below the currently allocated memory immediately evicts entries
    /// until the new budget is honored.
    ///
    /// # Examples
    /// ```
    /// # use hivecache::lru::LruStore;
    /// let mut lru = LruStore::new(1024);
    /// lru.put("Foo0".to_owned(), "Bar".to_owned());
    /// lru.put("Foo1".to_owned(), "Bar".to_owned());
    /// lru.put("Foo2".to_owned(), "Bar".to_owned());
    /// assert_eq!(lru.len(), 3);
    ///
    /// // Now request that the store is reduced to 14 bytes...
    /// lru.set_max_memory(14);
    ///
    /// // .. this will kick all but the last two entries out...
    /// assert_eq!(lru.len(), 2);
    /// ```
    pub fn set_max_memory(&mut self, max_memory: usize) {
        let previous_max_memory = self.max_memory;
        self.max_memory = max_memory;
        if max_memory > 0 && (previous_max_memory == 0 || previous_max_memory > max_memory) {
            self.enforce_limit();
        }
    }

    /// Returns the total number of reads performed on this store.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the total number of writes performed on this store.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            reads => self.hits as f32 / reads as f32 * 100.,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lru::LruStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn max_memory_is_enforced() {
        let mut lru = LruStore::new(12 * 4);

        // We expect 4 entries with a size of 12 bytes each to fully fit in the store....
        // (Note that the allocation tracking only takes the raw string sizes into account
        // and ignores the size of the underlying table itself.)
        lru.put("Hello0".to_owned(), "World0".to_owned());
        lru.put("Hello1".to_owned(), "World1".to_owned());
        lru.put("Hello2".to_owned(), "World2".to_owned());
        lru.put("Hello3".to_owned(), "World3".to_owned());
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.allocated_memory(), 12 * 4);
        assert_eq!(lru.get("Hello0").unwrap(), &"World0".to_owned());
        assert_eq!(lru.get("Hello1").unwrap(), &"World1".to_owned());
        assert_eq!(lru.get("Hello2").unwrap(), &"World2".to_owned());
        assert_eq!(lru.get("Hello3").unwrap(), &"World3".to_owned());

        // If we replace an entry, the used memory is corrected...
        lru.put("Hello1".to_owned(), "".to_owned());
        assert_eq!(lru.allocated_memory(), 12 * 4 - 6);
        assert_eq!(lru.len(), 4);

        // Restore the original entry, so that the table has four entries with 12 bytes each...
        lru.put("Hello1".to_owned(), "World1".to_owned());
        assert_eq!(lru.allocated_memory(), 12 * 4);

        // If we now replace an entry with a value which is one byte longer, the budget is
        // exceeded and a single entry has to be dropped....
        lru.put("Hello0".to_owned(), "World01".to_owned());
        assert_eq!(lru.allocated_memory(), 12 * 3 + 1);
        assert_eq!(lru.len(), 3);
        // "Hello2" was the least recently touched/modified, so it will have been evicted to
        // make room for our grown entry...
        assert_eq!(lru.get("Hello2"), None);
        assert_eq!(lru.get("Hello0").unwrap(), &"World01".to_owned());
    }

    #[test]
    fn eviction_starts_with_the_least_recently_used_entry() {
        // Room for two entries of four bytes each...
        let mut lru = LruStore::new(10);

        lru.put("k1".to_owned(), "v1".to_owned());
        lru.put("k2".to_owned(), "v2".to_owned());
        lru.put("k3".to_owned(), "v3".to_owned());

        // The third put exceeded the budget, so the oldest entry (k1) is gone...
        assert_eq!(lru.get("k1"), None);
        assert_eq!(lru.get("k2").unwrap(), &"v2".to_owned());
        assert_eq!(lru.get("k3").unwrap(), &"v3".to_owned());
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn reads_protect_entries_from_eviction() {
        let mut lru = LruStore::new(10);

        lru.put("k1".to_owned(), "v1".to_owned());
        lru.put("k2".to_owned(), "v2".to_owned());

        // Touching k1 makes k2 the coldest entry...
        assert_eq!(lru.get("k1").is_some(), true);

        lru.put("k3".to_owned(), "v3".to_owned());
        assert_eq!(lru.get("k2"), None);
        assert_eq!(lru.get("k1").is_some(), true);
        assert_eq!(lru.get("k3").is_some(), true);
    }

    #[test]
    fn an_unbounded_store_never_evicts() {
        let mut lru = LruStore::new(0);

        for index in 0..1000 {
            lru.put(format!("key-{}", index), "X".repeat(128));
        }

        assert_eq!(lru.len(), 1000);
        assert_eq!(lru.get("key-0").is_some(), true);
    }

    #[test]
    fn an_oversized_entry_leaves_the_store_empty() {
        let mut lru = LruStore::new(16);

        lru.put("small".to_owned(), "value".to_owned());
        assert_eq!(lru.len(), 1);

        // This entry can never fit, so enforcing the budget evicts everything including
        // the entry itself...
        lru.put("large".to_owned(), "X".repeat(64));
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.allocated_memory(), 0);
    }

    #[test]
    fn the_eviction_callback_observes_each_evicted_entry() {
        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let evictions = Arc::new(AtomicUsize::new(0));

        let mut lru = LruStore::new(10);
        let callback_log = evicted.clone();
        let callback_count = evictions.clone();
        lru.set_eviction_callback(Box::new(move |key, _value: &String| {
            callback_log.lock().unwrap().push(key.to_owned());
            let _ = callback_count.fetch_add(1, Ordering::Relaxed);
        }));

        lru.put("k1".to_owned(), "v1".to_owned());
        lru.put("k2".to_owned(), "v2".to_owned());
        lru.put("k3".to_owned(), "v3".to_owned());
        lru.put("k4".to_owned(), "v4".to_owned());

        assert_eq!(evictions.load(Ordering::Relaxed), 2);
        assert_eq!(evicted.lock().unwrap().as_slice(), &["k1", "k2"]);
    }

    #[test]
    fn shrinking_the_budget_evicts_immediately() {
        let mut lru = LruStore::new(0);
        lru.put("Hello0".to_owned(), "World0".to_owned());
        lru.put("Hello1".to_owned(), "World1".to_owned());
        lru.put("Hello2".to_owned(), "World2".to_owned());
        assert_eq!(lru.len(), 3);

        lru.set_max_memory(25);
        assert_eq!(lru.max_memory(), 25);
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.get("Hello0"), None);
    }

    #[test]
    fn metrics_are_computed_correctly() {
        let mut lru = LruStore::new(64);

        // Write 3 values into the store...
        lru.put("A".to_owned(), "A".to_owned());
        lru.put("B".to_owned(), "B".to_owned());
        lru.put("C".to_owned(), "C".to_owned());

        // Perform 4 reads, of which 3 hit an entry...
        assert_eq!(lru.get("A").is_some(), true);
        assert_eq!(lru.get("B").is_some(), true);
        assert_eq!(lru.get("C").is_some(), true);
        assert_eq!(lru.get("D").is_none(), true);

        // ... therefore we had 3 writes and 4 reads of which 3 hit a value, which yields a
        // hit rate of 75%
        assert_eq!(lru.writes(), 3);
        assert_eq!(lru.reads(), 4);
        assert_eq!(lru.hit_rate().round() as i32, 75);

        // We know our keys and values consume 6 bytes...
        assert_eq!(lru.allocated_memory(), 6);
    }
}
