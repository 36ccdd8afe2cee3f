//! Provides the consistent-hash ring which assigns every key to its owning peer.
//!
//! Each real node is projected onto the ring as a number of **virtual nodes** (replicas).
//! Spreading many virtual points per real node over the ring smooths the key distribution, so
//! that neither a small peer set nor an unlucky hash clusters most keys onto one node. A key
//! is owned by the real node behind the first virtual point at or after the key's own hash,
//! wrapping around at the end of the ring.
//!
//! The ring is a plain data structure without interior locking. Its user (the
//! [PeerPool](crate::transport::PeerPool)) guards it together with the peer lookup table.
//!
//! # Example
//! ```
//! # use hivecache::ring::HashRing;
//! let mut ring = HashRing::new(50);
//! ring.add(&["10.0.0.1:2610", "10.0.0.2:2610", "10.0.0.3:2610"]);
//!
//! // Every key maps to exactly one node and the mapping is stable...
//! let owner = ring.get("some-key").unwrap().to_owned();
//! assert_eq!(ring.get("some-key").unwrap(), owner);
//! ```
use fnv::FnvHashMap;

/// Maps a byte sequence to a position on the ring.
///
/// The default is CRC32/IEEE. A deployment may inject its own function as long as all peers
/// agree on it, as the ring positions have to be computed identically on every node.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// A consistent-hash ring mapping string keys to node names.
///
/// For a fixed hash function, [get](HashRing::get) is a pure function of the nodes previously
/// added and removed.
pub struct HashRing {
    replicas: usize,
    hash: HashFn,
    points: Vec<u32>,
    owners: FnvHashMap<u32, String>,
}

impl HashRing {
    /// Creates an empty ring which projects each node onto **replicas** virtual points,
    /// hashed with CRC32/IEEE.
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hash(replicas, Box::new(crc32fast::hash))
    }

    /// Creates an empty ring using a custom hash function.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        HashRing {
            replicas,
            hash,
            points: Vec::new(),
            owners: FnvHashMap::default(),
        }
    }

    /// Adds the given nodes to the ring.
    ///
    /// For each node, **replicas** virtual points are computed by hashing the replica index
    /// (in decimal) concatenated with the node name. If two virtual points collide, the node
    /// added last wins the colliding point. With a reasonable replica count this is both
    /// unlikely and harmless, as only a single virtual point (not the node) is lost.
    pub fn add<S: AsRef<str>>(&mut self, nodes: &[S]) {
        for node in nodes {
            let node = node.as_ref();
            for replica in 0..self.replicas {
                let point = (self.hash)(format!("{}{}", replica, node).as_bytes());
                self.points.push(point);
                let _ = self.owners.insert(point, node.to_owned());
            }
        }

        self.points.sort_unstable();
    }

    /// Removes a previously added node along with all of its virtual points.
    pub fn remove(&mut self, node: &str) {
        for replica in 0..self.replicas {
            let point = (self.hash)(format!("{}{}", replica, node).as_bytes());
            if let Ok(position) = self.points.binary_search(&point) {
                let _ = self.points.remove(position);
            }
            let _ = self.owners.remove(&point);
        }
    }

    /// Determines the node owning the given key.
    ///
    /// This walks the ring clockwise from the key's hash to the next virtual point (wrapping
    /// around after the highest point) and returns the real node behind it. Returns **None**
    /// on an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = self.points.partition_point(|point| *point < hash);
        let point = self.points[index % self.points.len()];

        self.owners.get(&point).map(String::as_str)
    }

    /// Determines if no nodes have been added yet.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
