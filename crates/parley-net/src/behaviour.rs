//! Composed libp2p `NetworkBehaviour` for Parley nodes.
//!
//! Combines Kademlia (peer routing), Identify (address exchange), Relay
//! client (NAT traversal via relays), DCUtR (direct connection upgrade
//! through relay) and `libp2p_stream` (raw per-protocol byte streams that
//! carry the framed chat protocol).

use libp2p::{
    dcutr, identify,
    kad::{self, store::MemoryStore},
    relay,
    swarm::NetworkBehaviour,
};

/// Composed network behaviour.
///
/// Construction is handled by [`super::transport::build_swarm`] via
/// `SwarmBuilder`; events surface as the derived `ParleyBehaviourEvent`.
#[derive(NetworkBehaviour)]
pub struct ParleyBehaviour {
    /// Distributed hash table used to locate peers by id
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Listen-address exchange with connected peers
    pub identify: identify::Behaviour,
    /// Circuit relay v2 client for NAT traversal
    pub relay_client: relay::client::Behaviour,
    /// Direct Connection Upgrade through Relay
    pub dcutr: dcutr::Behaviour,
    /// Inbound and outbound protocol streams
    pub stream: libp2p_stream::Behaviour,
}
