//! Provides the ring-backed peer picker and the RESP peer fetcher.
//!
//! The [PeerPool](PeerPool) knows the addresses of all nodes in the deployment (including the
//! local one) and projects them onto a [HashRing](crate::ring::HashRing). For each key it can
//! therefore decide whether the local node should load it or whether another peer owns it, in
//! which case it hands out a [RemotePeer](RemotePeer) pointing at the owner.
//!
//! A [RemotePeer](RemotePeer) fetches a value by sending a regular `CACHE.GET` to the owning
//! node, so the peer-to-peer path uses exactly the protocol and server every other client
//! uses. As both group and key travel as length-prefixed bulk strings, no escaping is needed
//! no matter what bytes they contain.
//!
//! The peer set can be swapped at runtime (typically from a config reload): the ring and the
//! per-peer table are rebuilt from scratch under one lock, so no lookup ever observes a half
//! updated topology.
use crate::peers::{PeerGetter, PeerPicker};
use crate::ring::HashRing;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Specifies the number of virtual points each peer occupies on the ring.
///
/// More points smooth the key distribution at the cost of a slightly larger ring. The default
/// works well for typical deployments of a handful up to some dozens of nodes.
pub const DEFAULT_REPLICAS: usize = 50;

/// Routes keys to the peers which own them.
pub struct PeerPool {
    self_address: String,
    replicas: usize,
    routes: Mutex<Routes>,
}

struct Routes {
    ring: HashRing,
    peers: FnvHashMap<String, Arc<RemotePeer>>,
}

impl PeerPool {
    /// Creates a pool for a node reachable under the given address.
    ///
    /// The address has to match the entry for this node in the peer lists handed to
    /// [set_peers](PeerPool::set_peers), as it is used to detect self-ownership.
    pub fn new(self_address: &str) -> Self {
        PeerPool::with_replicas(self_address, DEFAULT_REPLICAS)
    }

    /// Creates a pool with a custom virtual point count per peer.
    pub fn with_replicas(self_address: &str, replicas: usize) -> Self {
        PeerPool {
            self_address: self_address.to_owned(),
            replicas,
            routes: Mutex::new(Routes {
                ring: HashRing::new(replicas),
                peers: FnvHashMap::default(),
            }),
        }
    }

    /// Returns the address under which the local node is reachable.
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Replaces the set of known peers.
    ///
    /// The list should contain all nodes of the deployment including the local one. The ring
    /// and the peer table are rebuilt from scratch, therefore the update is atomic from the
    /// perspective of concurrent [pick](PeerPicker::pick) calls.
    pub fn set_peers<S: AsRef<str>>(&self, addresses: &[S]) {
        let mut ring = HashRing::new(self.replicas);
        ring.add(addresses);

        let mut peers = FnvHashMap::default();
        for address in addresses {
            let address = address.as_ref().to_owned();
            let peer = Arc::new(RemotePeer::new(&address));
            let _ = peers.insert(address, peer);
        }

        *self.routes.lock().unwrap() = Routes { ring, peers };
    }
}

impl PeerPicker for PeerPool {
    fn pick(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let routes = self.routes.lock().unwrap();
        match routes.ring.get(key) {
            Some(owner) if owner != self.self_address => {
                log::debug!("Picked peer {} for {}", owner, key);
                match routes.peers.get(owner) {
                    Some(peer) => {
                        let getter: Arc<dyn PeerGetter> = peer.clone();
                        Some(getter)
                    }
                    None => None,
                }
            }
            _ => None,
        }
    }
}

/// Fetches values from a single remote peer via RESP.
///
/// Each fetch uses a fresh connection. Peer fetches are rare by design (they only happen on
/// local misses for remotely owned keys, and the single-flight guard collapses bursts), so
/// pooling connections here would add state for little gain.
pub struct RemotePeer {
    address: String,
}

impl RemotePeer {
    /// Creates a fetcher for the peer reachable under the given address.
    pub fn new(address: &str) -> Self {
        RemotePeer {
            address: address.to_owned(),
        }
    }

    fn encode_request(group: &str, key: &str) -> BytesMut {
        let mut request = BytesMut::with_capacity(64 + group.len() + key.len());
        request.put_slice(b"*3\r\n$9\r\nCACHE.GET\r\n");
        request.put_slice(format!("${}\r\n{}\r\n", group.len(), group).as_bytes());
        request.put_slice(format!("${}\r\n{}\r\n", key.len(), key).as_bytes());

        request
    }
}

#[async_trait]
impl PeerGetter for RemotePeer {
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Cannot connect to peer {}", self.address))?;

        let request = RemotePeer::encode_request(group, key);
        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(8192);
        loop {
            if let Some(reply) = decode_reply(&buffer)? {
                return Ok(reply);
            }

            let bytes_read = stream.read_buf(&mut buffer).await?;
            if bytes_read == 0 {
                return Err(anyhow!(
                    "Peer {} closed the connection before sending a complete reply!",
                    self.address
                ));
            }
        }
    }
}

/// Tries to decode a single RESP reply from the given buffer.
///
/// Returns **Ok(None)** while the reply is still incomplete. A complete error reply is
/// surfaced as **Err** right away, a complete bulk or simple string as its payload bytes.
fn decode_reply(buffer: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(marker) = buffer.first() else {
        return Ok(None);
    };

    match *marker {
        b'$' => {
            let Some(header_end) = find_crlf(buffer, 1) else {
                return Ok(None);
            };
            let header = std::str::from_utf8(&buffer[1..header_end])
                .map_err(|_| anyhow!("Received a malformed bulk length!"))?;
            let length: i64 = header
                .parse()
                .map_err(|_| anyhow!("Received a malformed bulk length!"))?;
            if length < 0 {
                return Err(anyhow!("The peer replied with an empty value!"));
            }

            let start = header_end + 2;
            let end = start + length as usize;
            if buffer.len() < end + 2 {
                return Ok(None);
            }
            Ok(Some(buffer[start..end].to_vec()))
        }
        b'+' => match find_crlf(buffer, 1) {
            Some(end) => Ok(Some(buffer[1..end].to_vec())),
            None => Ok(None),
        },
        b'-' => match find_crlf(buffer, 1) {
            Some(end) => Err(anyhow!(
                "The peer replied with an error: {}",
                String::from_utf8_lossy(&buffer[1..end])
            )),
            None => Ok(None),
        },
        marker => Err(anyhow!(
            "Received an unexpected reply marker: '{}'!",
            marker as char
        )),
    }
}

/// Locates the next CRLF at or after the given offset.
fn find_crlf(buffer: &[u8], offset: usize) -> Option<usize> {
    (offset..buffer.len().saturating_sub(1)).find(|&index| &buffer[index..index + 2] == b"\r\n")
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use crate::group::Registry;
    use crate::peers::{FnLoader, PeerGetter, PeerPicker};
    use crate::server::Server;
    use crate::testing::test_async;
    use crate::transport::{decode_reply, PeerPool, RemotePeer};
    use std::sync::Arc;

    #[test]
    fn replies_are_decoded() {
        assert_eq!(decode_reply(b"").unwrap(), None);
        assert_eq!(decode_reply(b"$3\r\nab").unwrap(), None);
        assert_eq!(decode_reply(b"$3\r\nabc\r\n").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(decode_reply(b"$0\r\n\r\n").unwrap(), Some(Vec::new()));
        assert_eq!(decode_reply(b"+PONG\r\n").unwrap(), Some(b"PONG".to_vec()));
        assert_eq!(decode_reply(b"-SERVER: kaputt\r\n").is_err(), true);
        assert_eq!(decode_reply(b"$-1\r\n").is_err(), true);
        assert_eq!(decode_reply(b"!boom\r\n").is_err(), true);
    }

    #[test]
    fn requests_are_encoded() {
        let request = RemotePeer::encode_request("scores", "Tom");
        assert_eq!(
            &request[..],
            b"*3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n"
        );
    }

    #[test]
    fn the_pool_excludes_the_local_node() {
        let pool = PeerPool::new("10.0.0.1:2610");
        pool.set_peers(&["10.0.0.1:2610"]);

        // Being the only node, we own every key ourselves...
        assert_eq!(pool.pick("some-key").is_none(), true);

        // Without any peers at all, the ring is empty and picking also yields nothing...
        let lonely = PeerPool::new("10.0.0.1:2610");
        assert_eq!(lonely.pick("some-key").is_none(), true);
    }

    #[test]
    fn the_pool_routes_each_key_to_one_owner() {
        let first = PeerPool::new("10.0.0.1:2610");
        first.set_peers(&["10.0.0.1:2610", "10.0.0.2:2610"]);
        let second = PeerPool::new("10.0.0.2:2610");
        second.set_peers(&["10.0.0.1:2610", "10.0.0.2:2610"]);

        // Both nodes agree on ownership: exactly one of them considers a key remote...
        for index in 0..100 {
            let key = format!("key-{}", index);
            let remote_for_first = first.pick(&key).is_some();
            let remote_for_second = second.pick(&key).is_some();
            assert_eq!(remote_for_first != remote_for_second, true, "{}", key);
        }
    }

    /// Starts two complete nodes and verifies that a remotely owned key is fetched through
    /// the peer protocol, cached on the owner and passed through (but not cached) locally.
    #[test]
    fn values_are_fetched_from_the_owning_peer() {
        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let addresses = ["127.0.0.1:1611", "127.0.0.2:1612"];
            let mut nodes = Vec::new();

            for (index, address) in addresses.iter().enumerate() {
                let platform = Builder::new()
                    .enable_caches()
                    .enable_config()
                    .enable_server()
                    .build()
                    .await;
                let port = 1611 + index;
                platform
                    .require::<Config>()
                    .load_from_string(
                        &format!(
                            "
                            server:
                                host: 127.0.0.{}
                                port: {}
                            ",
                            index + 1,
                            port
                        ),
                        None,
                    )
                    .unwrap();

                let tag = if index == 0 { "a" } else { "b" };
                let registry = platform.require::<Registry>();
                let group = registry.create_group(
                    "words",
                    1024 * 1024,
                    Box::new(FnLoader::new(move |key: &str| {
                        Ok(format!("{}:{}", tag, key).into_bytes())
                    })),
                );

                let pool = Arc::new(PeerPool::new(address));
                pool.set_peers(&addresses);
                group.register_peers(pool.clone());

                Server::fork_and_await(&platform.require::<Server>()).await;
                nodes.push((platform, group, pool));
            }

            let (ref platform_a, ref group_a, ref pool_a) = nodes[0];
            let (ref platform_b, ref group_b, _) = nodes[1];

            // Find a key which node a does not own itself...
            let remote_key = (0..)
                .map(|index| format!("word-{}", index))
                .find(|key| pool_a.pick(key).is_some())
                .unwrap();

            // Fetching it on a yields b's value, populates b's cache and leaves a's empty...
            let value = group_a.get(&remote_key).await.unwrap();
            assert_eq!(value.to_string(), format!("b:{}", remote_key));
            assert_eq!(group_a.stats().entries, 0);
            assert_eq!(group_b.stats().entries, 1);

            // A locally owned key is loaded and cached locally...
            let local_key = (0..)
                .map(|index| format!("word-{}", index))
                .find(|key| pool_a.pick(key).is_none())
                .unwrap();
            let value = group_a.get(&local_key).await.unwrap();
            assert_eq!(value.to_string(), format!("a:{}", local_key));
            assert_eq!(group_a.stats().entries, 1);

            // A direct peer fetch against b works as well...
            let peer = RemotePeer::new("127.0.0.2:1612");
            let fetched = peer.fetch("words", &remote_key).await.unwrap();
            assert_eq!(fetched, format!("b:{}", remote_key).into_bytes());

            // Asking b for an unknown group yields an error...
            let error = peer.fetch("missing", "key").await.unwrap_err();
            assert_eq!(error.to_string().contains("Unknown group"), true);

            platform_a.terminate();
            platform_b.terminate();
        });
    }
}
