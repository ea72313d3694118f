use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::{dcutr, identify, noise, yamux, Swarm, SwarmBuilder};
use tracing::info;

use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::identity::Identity;

use crate::behaviour::ParleyBehaviour;
use crate::error::NetError;

/// The libp2p keypair for a node identity (same Ed25519 secret).
pub fn keypair_from_identity(identity: &Identity) -> Result<Keypair, NetError> {
    let secret = *identity.secret_bytes();
    Keypair::ed25519_from_bytes(secret).map_err(|e| NetError::Transport(e.to_string()))
}

pub fn build_swarm(keypair: Keypair) -> Result<Swarm<ParleyBehaviour>, NetError> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| NetError::Transport(e.to_string()))?
        .with_behaviour(|key, relay_client| {
            let local_peer_id = key.public().to_peer_id();

            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::new(local_peer_id, store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config = identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                .with_push_listen_addr_updates(true)
                .with_interval(Duration::from_secs(60));

            ParleyBehaviour {
                kademlia,
                identify: identify::Behaviour::new(identify_config),
                relay_client,
                dcutr: dcutr::Behaviour::new(local_peer_id),
                stream: libp2p_stream::Behaviour::new(),
            }
        })
        .map_err(|e| NetError::Transport(e.to_string()))?
        // Chat sessions are long-lived; idle connections are kept for the call heartbeat.
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(120)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "Built Parley swarm with QUIC + Relay transport");

    Ok(swarm)
}
