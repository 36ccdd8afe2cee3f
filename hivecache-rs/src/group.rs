//! Provides cache groups and the registry which keeps them.
//!
//! A [Group](Group) is a named cache namespace binding a bounded local store, an origin
//! [Loader](crate::peers::Loader) and (optionally) a peer picker. Its [get](Group::get)
//! implements the complete read path:
//!
//! 1. Consult the local cache.
//! 2. On a miss, enter the per-key single-flight guard.
//! 3. If a remote peer owns the key, fetch it there. The result is **not** written to the
//!    local cache, as the owning peer caches it.
//! 4. If no peer owns the key or the peer fetch failed, invoke the origin loader and cache
//!    the result locally.
//!
//! Groups are created through a [Registry](Registry) which maps names to groups for the whole
//! node, so that the server can route an incoming `CACHE.GET` to the proper group.
use crate::average::Average;
use crate::byteview::ByteView;
use crate::lru::Cache;
use crate::peers::{Loader, PeerPicker};
use crate::singleflight::SingleFlight;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

/// Enumerates the errors surfaced by [Group::get](Group::get).
///
/// The error is **Clone** as a single failed load is reported to every caller coalesced onto
/// it.
#[derive(Clone, Debug)]
pub enum CacheError {
    /// An empty key was passed in. The cache was not consulted.
    EmptyKey,

    /// The origin loader failed to produce the value.
    ///
    /// Note that peer failures never surface here, they silently fall back to the origin.
    Loader(Arc<anyhow::Error>),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::EmptyKey => write!(f, "key is required"),
            CacheError::Loader(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for CacheError {}

/// Describes the current state of a [Group](Group) for diagnostic purposes.
#[derive(Clone)]
pub struct GroupStats {
    /// Contains the number of locally cached entries.
    pub entries: usize,

    /// Contains the memory in bytes currently allocated by the local cache.
    pub allocated_memory: usize,

    /// Contains the configured memory budget in bytes (0 = unbounded).
    pub max_memory: usize,

    /// Contains the total number of cache lookups.
    pub reads: usize,

    /// Contains the total number of cache writes.
    pub writes: usize,

    /// Contains the percentage of lookups which hit the local cache.
    pub hit_rate: f32,

    /// Records the number and average duration of load operations (peer or origin).
    pub loads: Average,
}

/// A named cache in front of an authoritative data source.
pub struct Group {
    name: String,
    origin: Box<dyn Loader>,
    cache: Cache,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    flights: SingleFlight<Result<ByteView, CacheError>>,
    loads: Average,
}

impl Group {
    fn new(name: &str, max_memory: usize, origin: Box<dyn Loader>) -> Self {
        Group {
            name: name.to_owned(),
            origin,
            cache: Cache::new(max_memory),
            peers: OnceLock::new(),
            flights: SingleFlight::new(),
            loads: Average::new(),
        }
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches a peer picker to this group.
    ///
    /// Without a picker, every miss goes straight to the origin. Registration is one-shot
    /// for the lifetime of the group.
    ///
    /// # Panics
    /// Panics if a picker has already been registered, as silently swapping the peer topology
    /// under a live group indicates a wiring error.
    pub fn register_peers(&self, picker: Arc<dyn PeerPicker>) {
        if self.peers.set(picker).is_err() {
            panic!(
                "A peer picker has been registered more than once for group {}!",
                self.name
            );
        }
    }

    /// Performs a cached lookup for the given key.
    ///
    /// See the [module docs](crate::group) for the exact read path. All concurrent callers
    /// asking for the same missing key share a single load, including its error.
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }

        if let Some(value) = self.cache.get(key) {
            log::debug!("[{}] Local hit for {}", self.name, key);
            return Ok(value);
        }

        self.flights.run(key, self.load(key)).await
    }

    /// Loads a missing key from the owning peer or the origin.
    ///
    /// This is the single-flight protected part of the read path: for each key, at most one
    /// instance runs at any time.
    async fn load(&self, key: &str) -> Result<ByteView, CacheError> {
        let watch = Instant::now();
        let result = self.load_from_peer_or_origin(key).await;
        self.loads.add(watch.elapsed().as_micros() as i32);

        result
    }

    async fn load_from_peer_or_origin(&self, key: &str) -> Result<ByteView, CacheError> {
        if let Some(picker) = self.peers.get() {
            if let Some(peer) = picker.pick(key) {
                match peer.fetch(&self.name, key).await {
                    // The owning peer populates its own cache, we only pass the value
                    // through...
                    Ok(data) => return Ok(ByteView::from(data)),
                    Err(error) => {
                        log::debug!("[{}] Peer fetch for {} failed: {}", self.name, key, error);
                    }
                }
            }
        }

        match self.origin.load(key).await {
            Ok(data) => {
                let value = ByteView::from(data);
                self.cache.add(key, value.clone());
                Ok(value)
            }
            Err(error) => Err(CacheError::Loader(Arc::new(error))),
        }
    }

    /// Changes the memory budget of the local cache.
    pub fn set_max_memory(&self, max_memory: usize) {
        self.cache.set_max_memory(max_memory);
    }

    /// Reports the current state of this group.
    pub fn stats(&self) -> GroupStats {
        let cache = self.cache.stats();
        GroupStats {
            entries: cache.entries,
            allocated_memory: cache.allocated_memory,
            max_memory: cache.max_memory,
            reads: cache.reads,
            writes: cache.writes,
            hit_rate: cache.hit_rate,
            loads: self.loads.clone(),
        }
    }
}

/// Keeps all groups of a node by name.
///
/// The registry is deliberately an explicit value rather than a process global. It is
/// registered in the [Platform](crate::platform::Platform) of a node, and tests simply create
/// their own.
#[derive(Default)]
pub struct Registry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry and registers it in the given platform.
    pub fn install(platform: &Arc<crate::platform::Platform>) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        platform.register::<Registry>(registry.clone());

        registry
    }

    /// Creates a group with the given name, memory budget (in bytes, 0 = unbounded) and
    /// origin loader.
    ///
    /// Creating a second group under an existing name replaces the previous binding, which is
    /// how a config reload swaps a group for a re-defined one. Callers holding an **Arc** to
    /// the replaced group keep a working (if orphaned) cache.
    pub fn create_group(
        &self,
        name: &str,
        max_memory: usize,
        origin: Box<dyn Loader>,
    ) -> Arc<Group> {
        let group = Arc::new(Group::new(name, max_memory, origin));
        let _ = self
            .groups
            .write()
            .unwrap()
            .insert(name.to_owned(), group.clone());

        group
    }

    /// Resolves the group with the given name.
    pub fn find(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Lists the names of all known groups in alphabetical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().unwrap().keys().cloned().collect();
        names.sort();

        names
    }
}

#[cfg(test)]
mod tests {
    use crate::group::{CacheError, Registry};
    use crate::peers::{FnLoader, PeerGetter, PeerPicker};
    use crate::testing::test_async;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// A picker which routes every key to a fixed getter.
    struct StaticPicker {
        getter: Arc<dyn PeerGetter>,
    }

    impl PeerPicker for StaticPicker {
        fn pick(&self, _key: &str) -> Option<Arc<dyn PeerGetter>> {
            Some(self.getter.clone())
        }
    }

    /// A peer which always delivers the same value.
    struct HealthyPeer;

    #[async_trait]
    impl PeerGetter for HealthyPeer {
        async fn fetch(&self, _group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
            Ok(format!("peer:{}", key).into_bytes())
        }
    }

    /// A peer whose transport is broken.
    struct BrokenPeer;

    #[async_trait]
    impl PeerGetter for BrokenPeer {
        async fn fetch(&self, _group: &str, _key: &str) -> anyhow::Result<Vec<u8>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn an_empty_key_is_refused_without_touching_the_cache() {
        test_async(async {
            let registry = Registry::new();
            let group = registry.create_group(
                "scores",
                1024,
                Box::new(FnLoader::new(|key: &str| Ok(key.as_bytes().to_vec()))),
            );

            assert!(matches!(group.get("").await, Err(CacheError::EmptyKey)));
            assert_eq!(group.stats().reads, 0);
        });
    }

    #[test]
    fn origin_loads_populate_the_cache() {
        test_async(async {
            let mut scores = HashMap::new();
            let _ = scores.insert("Tom".to_owned(), "630".to_owned());

            let loads = Arc::new(AtomicUsize::new(0));
            let load_counter = loads.clone();

            let registry = Registry::new();
            let group = registry.create_group(
                "scores",
                1024,
                Box::new(FnLoader::new(move |key: &str| {
                    let _ = load_counter.fetch_add(1, Ordering::SeqCst);
                    scores
                        .get(key)
                        .map(|value| value.as_bytes().to_vec())
                        .ok_or_else(|| anyhow!("{} not exist", key))
                })),
            );

            // The first lookup goes to the origin...
            assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"630");
            assert_eq!(loads.load(Ordering::SeqCst), 1);

            // ...the second one is served from the cache.
            assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"630");
            assert_eq!(loads.load(Ordering::SeqCst), 1);

            // Unknown keys surface the loader error...
            let error = group.get("Unknown").await.unwrap_err();
            assert_eq!(error.to_string(), "Unknown not exist");
            assert!(matches!(error, CacheError::Loader(_)));
        });
    }

    #[test]
    fn concurrent_lookups_share_a_single_origin_load() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let load_counter = loads.clone();

            let registry = Registry::new();
            let group = registry.create_group(
                "slow",
                1024,
                Box::new(SlowLoader {
                    loads: load_counter,
                }),
            );

            let mut handles = Vec::new();
            for _ in 0..100 {
                let group = group.clone();
                handles.push(tokio::spawn(async move { group.get("key").await }));
            }

            for handle in handles {
                assert_eq!(handle.await.unwrap().unwrap().as_slice(), b"value");
            }
            assert_eq!(loads.load(Ordering::SeqCst), 1);
        });
    }

    /// An origin which takes a while, so that concurrent lookups pile up on it.
    struct SlowLoader {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::peers::Loader for SlowLoader {
        async fn load(&self, _key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(b"value".to_vec())
        }
    }

    #[test]
    fn peer_values_are_not_cached_locally() {
        test_async(async {
            let registry = Registry::new();
            let group = registry.create_group(
                "scores",
                1024,
                Box::new(FnLoader::new(|_key: &str| Ok(b"local".to_vec()))),
            );
            group.register_peers(Arc::new(StaticPicker {
                getter: Arc::new(HealthyPeer),
            }));

            assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"peer:Tom");

            // The owning peer caches the value, we must not...
            assert_eq!(group.stats().entries, 0);
        });
    }

    #[test]
    fn peer_failures_fall_back_to_the_origin() {
        test_async(async {
            let registry = Registry::new();
            let group = registry.create_group(
                "scores",
                1024,
                Box::new(FnLoader::new(|_key: &str| Ok(b"local-v".to_vec()))),
            );
            group.register_peers(Arc::new(StaticPicker {
                getter: Arc::new(BrokenPeer),
            }));

            assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"local-v");

            // The fallback value was loaded locally and therefore is cached...
            assert_eq!(group.stats().entries, 1);
            assert_eq!(group.get("Tom").await.unwrap().as_slice(), b"local-v");
        });
    }

    #[test]
    #[should_panic]
    fn registering_peers_twice_is_refused() {
        let registry = Registry::new();
        let group = registry.create_group(
            "scores",
            1024,
            Box::new(FnLoader::new(|_key: &str| Ok(Vec::new()))),
        );

        group.register_peers(Arc::new(StaticPicker {
            getter: Arc::new(HealthyPeer),
        }));
        group.register_peers(Arc::new(StaticPicker {
            getter: Arc::new(HealthyPeer),
        }));
    }

    #[test]
    fn groups_are_replaced_on_rebinding() {
        let registry = Registry::new();
        let first = registry.create_group(
            "scores",
            1024,
            Box::new(FnLoader::new(|_key: &str| Ok(b"first".to_vec()))),
        );
        let second = registry.create_group(
            "scores",
            1024,
            Box::new(FnLoader::new(|_key: &str| Ok(b"second".to_vec()))),
        );

        assert_eq!(first.name(), second.name());
        assert_eq!(registry.names(), vec!["scores".to_owned()]);

        // The registry now resolves to the new binding...
        let resolved = registry.find("scores").unwrap();
        assert!(Arc::ptr_eq(&resolved, &second));
        assert!(!Arc::ptr_eq(&resolved, &first));
    }

    #[test]
    fn unknown_groups_are_not_found() {
        let registry = Registry::new();
        assert!(registry.find("missing").is_none());
        assert!(registry.names().is_empty());
    }
}
