//! Wires a config-driven cache node: the peer set and the group definitions.
//!
//! To use this facility, [install](install) has to be invoked. The configuration is fetched
//! from the system config and will be automatically re-applied once the file changes.
//!
//! # Configuration
//! In the system config, a **peers** object names the local node and the full peer set, and a
//! **caches** object specifies one group per entry:
//!
//! ```yaml
//! peers:
//!     # The address under which THIS node is reachable by its peers. Has to be listed
//!     # in nodes as well.
//!     self: "10.0.0.1:2610"
//!     nodes:
//!         - "10.0.0.1:2610"
//!         - "10.0.0.2:2610"
//!         - "10.0.0.3:2610"
//! caches:
//!     dictionary:
//!         # Specifies the maximal amount of memory to use (in bytes).
//!         # Supports common suffixes like: k, m, g, t
//!         max_memory: 64m
//!         # Specifies the directory from which cache misses are loaded: the key is the
//!         # file name relative to this directory.
//!         origin: data/dictionary
//! ```
//!
//! Omitting the **peers** object yields a standalone node which answers every lookup from its
//! own cache or origin. Changing **max_memory** resizes a running group in place (evicting if
//! needed); adding a cache entry creates the group; changing the **origin** of an existing
//! group replaces the group binding, which implicitly drops the old group's hot data.
//!
//! The shipped origin is a directory loader. Embedders with other authoritative sources
//! create their groups programmatically against the [Registry](crate::group::Registry)
//! instead of using this module.
use crate::config::Config;
use crate::fmt::parse_size;
use crate::group::{Group, Registry};
use crate::peers::Loader;
use crate::platform::Platform;
use crate::spawn;
use crate::transport::PeerPool;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use yaml_rust::Yaml;

/// Loads origin data from a directory, treating the key as file name.
///
/// Keys are confined to the configured root: absolute keys and keys containing parent
/// references are refused.
pub struct DirLoader {
    root: PathBuf,
}

impl DirLoader {
    /// Creates a loader serving files below the given root directory.
    pub fn new(root: &str) -> Self {
        DirLoader {
            root: PathBuf::from(root),
        }
    }
}

#[async_trait]
impl Loader for DirLoader {
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        if key.starts_with('/') || key.split('/').any(|part| part == "..") {
            return Err(anyhow!("Invalid key: {}", key));
        }

        let path = self.root.join(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))
    }
}

/// Installs the node setup which applies the **peers** and **caches** config sections.
///
/// This will apply the current config immediately and re-apply it on every config change.
pub fn install(platform: Arc<Platform>) {
    apply_config(&platform);

    spawn!(async move {
        let config = platform.require::<Config>();
        let mut config_changed = config.notifier();

        while platform.is_running() {
            match config_changed.recv().await {
                Ok(_) => apply_config(&platform),
                _ => return,
            }
        }
    });
}

/// Applies the current system config onto the peer pool and the group registry.
///
/// Note that this provides a safety mechanism: invalid or missing settings never destroy
/// running state, they are logged and skipped. This prevents the node from wiping its caches
/// in the case of an accidental or partial config change.
fn apply_config(platform: &Arc<Platform>) {
    let config = platform.require::<Config>();
    let handle = config.current();

    apply_peers(platform, handle.root());
    apply_caches(platform, handle.root());
}

/// Applies the **peers** section: creates the pool on first sight and swaps the peer set.
fn apply_peers(platform: &Arc<Platform>, root: &Yaml) {
    let self_address = match root["peers"]["self"].as_str() {
        Some(address) => address,
        None => {
            log::info!("Config does not contain a 'peers' object. Running standalone.");
            return;
        }
    };

    let nodes: Vec<String> = match root["peers"]["nodes"].as_vec() {
        Some(nodes) => nodes
            .iter()
            .filter_map(|node| node.as_str().map(str::to_owned))
            .collect(),
        None => Vec::new(),
    };
    if nodes.is_empty() {
        log::error!("'peers.nodes' is empty or missing. Keeping the previous peer set.");
        return;
    }

    match platform.find::<PeerPool>() {
        Some(pool) => {
            // The identity of a node cannot change at runtime, as every group already
            // holds a reference onto this pool...
            if pool.self_address() != self_address {
                log::error!(
                    "'peers.self' changed from {} to {}. This requires a restart and is ignored.",
                    pool.self_address(),
                    self_address
                );
            }
            pool.set_peers(&nodes);
            log::info!("Updated the peer set to {} node(s).", nodes.len());
        }
        None => {
            let pool = Arc::new(PeerPool::new(self_address));
            pool.set_peers(&nodes);
            platform.register::<PeerPool>(pool);
            log::info!(
                "Joined the peer set as {} ({} node(s) in total).",
                self_address,
                nodes.len()
            );
        }
    }
}

/// Applies the **caches** section: creates, resizes or re-binds the configured groups.
fn apply_caches(platform: &Arc<Platform>, root: &Yaml) {
    let caches = match &root["caches"] {
        Yaml::Hash(caches) => caches,
        _ => {
            log::info!("Config does not contain a 'caches' object. Skipping config update.");
            return;
        }
    };

    let registry = match platform.find::<Registry>() {
        Some(registry) => registry,
        None => {
            log::error!("No registry is installed. Cannot create any cache groups.");
            return;
        }
    };

    for (name, settings) in caches {
        let name = match name.as_str() {
            Some(name) => name,
            None => continue,
        };
        if let Err(error) = create_or_update(platform, &registry, name, settings) {
            log::error!("Not going to create or update {}: {}", name, error);
        }
    }
}

/// Creates or updates the group with the given name based on the given config element.
///
/// In case of an invalid config, the current group is left untouched. Therefore this will not
/// create a group with an invalid or partial config, but it will also not damage an active
/// group due to an accident or config problem.
fn create_or_update(
    platform: &Arc<Platform>,
    registry: &Registry,
    name: &str,
    settings: &Yaml,
) -> anyhow::Result<()> {
    let max_memory = parse_size(settings["max_memory"].as_str().unwrap_or(""))
        .context("Failed to parse 'max_memory'")?;
    let origin = settings["origin"]
        .as_str()
        .ok_or_else(|| anyhow!("No 'origin' directory was given"))?;

    if let Some(group) = registry.find(name) {
        group.set_max_memory(max_memory);
        return Ok(());
    }

    log::info!("Creating new cache group {}...", name);
    let group: Arc<Group> =
        registry.create_group(name, max_memory, Box::new(DirLoader::new(origin)));
    if let Some(pool) = platform.find::<PeerPool>() {
        group.register_peers(pool);
    }

    Ok(())
}
