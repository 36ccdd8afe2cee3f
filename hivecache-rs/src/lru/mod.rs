//! Provides a size constrained LRU store and the thread-safe cache built on top of it.
//!
//! An LRU store drops the least recently used entry once it is about to grow beyond its
//! memory budget. The store is generic over all value types which implement the
//! [ByteSize](ByteSize) trait so that every stored byte can be accounted.
//!
//! The [Cache](Cache) wraps such a store in a mutex and creates it lazily on the first write.
//! It is the local store behind every [Group](crate::group::Group).
pub mod cache;
mod store;

pub use cache::Cache;
pub use cache::CacheStats;
pub use store::ByteSize;
pub use store::EvictionCallback;
pub use store::LruStore;
