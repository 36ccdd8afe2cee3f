//! Hivecache is a library for running distributed in-memory caches which talk to each other
//! and to their clients via the RESP protocol as defined by Redis.
//!
//! # Introduction
//! A **hivecache** deployment is a flat set of identical nodes. Each node hosts a number of
//! named caches ("groups"), each of which sits in front of an authoritative data source (the
//! **origin**). A client may ask any node for any key of any group. The node answers from its
//! own memory if possible, fetches the value from the peer which owns the key under consistent
//! hashing if not, and only consults the origin as a last resort. Concurrent demand for the
//! same key is collapsed into a single origin or peer load.
//!
//! Three properties drive the design:
//! * **Bounded memory**: each group maintains a local LRU store which accounts every stored
//!   byte and evicts the least recently used entries once its budget is exceeded.
//! * **Single ownership**: a consistent-hash ring with virtual nodes assigns every key to
//!   exactly one peer, so the hot copy of each value lives in one place.
//! * **Load collapsing**: a per-key single-flight guard ensures that no matter how many
//!   clients ask for a missing key at once, the origin sees at most one request.
//!
//! Note that there is deliberately **no TTL and no invalidation**: a value cached locally can
//! outlive its origin truth until memory pressure evicts it. Hivecache targets semi-constant
//! data (think of code sets, rendered fragments or master data) where this is acceptable. If
//! your data changes and the change must become visible, this is not the right tool.
//!
//! # Wire protocol
//! Both the client facing side and the peer-to-peer fetch path use the
//! [RESP protocol](https://redis.io/topics/protocol). This is way simpler to parse than HTTP,
//! permits zero-copy request handling and means that every platform which has a Redis client
//! can talk to a node (as can `redis-cli`). The server understands:
//! * **PING**: answers `PONG` and can be used for health checks.
//! * **CACHE.GET**: `CACHE.GET group key` runs the full read path described above and yields
//!   the value as a bulk string.
//! * **CACHE.STATS**: `CACHE.STATS` lists all groups, `CACHE.STATS group` provides detailed
//!   metrics for one group.
//!
//! # Modules
//! * The core data structures live in [lru](crate::lru), [ring](crate::ring),
//!   [singleflight](crate::singleflight) and [byteview](crate::byteview).
//! * [group](crate::group) composes them with the capabilities declared in
//!   [peers](crate::peers) into the actual read path.
//! * [transport](crate::transport) provides the ring-backed peer picker and the RESP peer
//!   fetcher, [server](crate::server) the TCP server in front of it all.
//! * [platform](crate::platform), [builder](crate::builder), [config](crate::config),
//!   [node](crate::node) and [signals](crate::signals) wire everything into a runnable,
//!   reload-aware process.
//!
//! # Example
//! ```no_run
//! use hivecache::builder::Builder;
//! use hivecache::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Let the config define the peer set and the cache groups...
//!     hivecache::node::install(platform.clone());
//!
//!     // Run the server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod byteview;
pub mod config;
pub mod fmt;
pub mod group;
pub mod lru;
pub mod node;
pub mod peers;
pub mod platform;
pub mod request;
pub mod response;
pub mod ring;
pub mod server;
pub mod signals;
pub mod singleflight;
pub mod transport;

/// Contains the version of the hivecache library.
pub const HIVECACHE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the hivecache build being used.
pub const HIVECACHE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up
/// the framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate hivecache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use redis::{Connection, RedisError};
    use std::sync::Mutex;
    use tokio::time::Duration;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. These are the ports (1610..1612) on which we start local servers
        /// for integration tests. Using this lock, we can still execute all other tests
        /// in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Executes a blocking Redis query in an async fashion.
    ///
    /// This is required as we must not block tokio in any way. Note that the redis crate
    /// itself would permit async queries, however this would drag a second executor setup
    /// into the tests, so we rather push the blocking client onto a worker thread.
    pub async fn query_redis_async<T, Q>(query: Q) -> Option<T>
    where
        Q: FnOnce(&mut Connection) -> Result<T, RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(|| {
            let client = redis::Client::open("redis://127.0.0.1:1610").unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }
}
