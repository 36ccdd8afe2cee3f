//! Declares the capabilities a cache group composes: the origin loader and the peer fetch
//! path.
//!
//! The group itself neither knows where authoritative data comes from nor how peers talk to
//! each other. It only consumes three narrow capabilities:
//! * a [Loader](Loader) turns a key into authoritative bytes,
//! * a [PeerPicker](PeerPicker) decides whether a remote peer owns a key,
//! * a [PeerGetter](PeerGetter) fetches a value from such a peer.
//!
//! The shipped picker/getter pair lives in [transport](crate::transport); tests and embedders
//! are free to provide their own.
use async_trait::async_trait;
use std::sync::Arc;

/// Obtains authoritative data for a key.
///
/// This is the user-supplied callback which is invoked whenever neither the local cache nor
/// the owning peer can provide a value. Loaders are expected to be slow (that is the point of
/// caching), but they should be correct: whatever they return is cached and served until
/// evicted.
///
/// For simple cases a plain function can be lifted into this capability via
/// [FnLoader](FnLoader).
#[async_trait]
pub trait Loader: Send + Sync {
    /// Produces the value for the given key or an error if the key is unknown to the origin.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Lifts a plain synchronous function into a [Loader](Loader).
///
/// # Example
/// ```
/// # use hivecache::peers::{FnLoader, Loader};
/// # #[tokio::main]
/// # async fn main() {
/// let loader = FnLoader::new(|key: &str| Ok(format!("value of {}", key).into_bytes()));
/// assert_eq!(loader.load("x").await.unwrap(), b"value of x");
/// # }
/// ```
pub struct FnLoader<F> {
    callback: F,
}

impl<F> FnLoader<F>
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    /// Wraps the given function.
    pub fn new(callback: F) -> Self {
        FnLoader { callback }
    }
}

#[async_trait]
impl<F> Loader for FnLoader<F>
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.callback)(key)
    }
}

/// Decides which peer (if any) a key should be fetched from.
pub trait PeerPicker: Send + Sync {
    /// Returns the getter for the peer owning the given key.
    ///
    /// Returns **None** if the key should be loaded locally, which is the case when no peers
    /// are known or when the local node owns the key itself. The latter rule is what keeps a
    /// fetch from ever being forwarded in a circle.
    fn pick(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches a value from a remote peer.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    /// Obtains the value for the given key of the given group from the remote peer.
    ///
    /// Any transport problem, including the peer itself failing to produce the value, is
    /// reported as an error. Peer errors are never fatal for the overall lookup as the caller
    /// falls back to its own origin.
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>>;
}
