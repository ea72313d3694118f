//! Node startup: open the store, load or create the node key and build the
//! swarm configuration from config and remembered peers.

use serde::Serialize;
use tracing::{info, warn};

use parley_net::SwarmConfig;
use parley_shared::identity::Identity;
use parley_store::{Store, StoreError};

use crate::config::NodeConfig;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    pub public_key: String,
    pub short_id: String,
}

impl IdentityInfo {
    pub fn of(identity: &Identity) -> Self {
        let public_key = hex::encode(identity.public_key_bytes());
        let short_id = format!("{}…{}", &public_key[..8], &public_key[public_key.len() - 8..]);
        Self { public_key, short_id }
    }
}

/// Open the store in the configured data directory.  A wrong passphrase
/// fails here, before any network activity.
pub fn open_store(config: &NodeConfig, passphrase: Option<&str>) -> Result<Store> {
    match Store::open_in_dir(&config.data_dir, passphrase) {
        Ok(store) => Ok(store),
        Err(StoreError::WrongPassphrase) => {
            warn!(dir = %config.data_dir.display(), "Store passphrase rejected");
            Err(StoreError::WrongPassphrase.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// The node key from the store, generated on first start.
pub fn load_identity(store: &Store) -> Result<Identity> {
    let identity = store.load_or_create_node_key()?;
    let info = IdentityInfo::of(&identity);
    info!(public_key = %info.short_id, "Node identity loaded");
    Ok(identity)
}

/// Swarm settings for this node, seeded with the routing peers saved on the
/// last shutdown.
pub fn swarm_config(config: &NodeConfig, store: &Store) -> SwarmConfig {
    let bootstrap_addrs = match store.load_bootstrap_peers() {
        Ok(peers) => peers
            .into_iter()
            .flat_map(|peer| {
                let suffix = format!("/p2p/{}", peer.id);
                peer.addresses.into_iter().map(move |addr| {
                    if addr.contains("/p2p/") {
                        addr
                    } else {
                        format!("{addr}{suffix}")
                    }
                })
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Could not load bootstrap peers");
            Vec::new()
        }
    };

    SwarmConfig {
        listen_port: config.listen_port,
        bootstrap_peers_path: config.bootstrap_file.clone(),
        bootstrap_addrs,
        ..SwarmConfig::default()
    }
}
