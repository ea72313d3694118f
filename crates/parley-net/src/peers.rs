//! Peer connection tracking.
//!
//! Keeps the set of connected peers with the address of each connection,
//! plus an address book of listen addresses learned through
//! Identify.  The address book outlives connections and is what gets saved
//! as bootstrap peers on shutdown.

use std::collections::HashMap;

use libp2p::{Multiaddr, PeerId};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct PeerTracker {
    /// Connected peers and the multiaddr each connection runs over.
    peers: HashMap<PeerId, Multiaddr>,
    address_book: HashMap<PeerId, Vec<Multiaddr>>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly connected peer.
    pub fn on_connected(&mut self, peer_id: PeerId, address: Multiaddr, is_relayed: bool) {
        debug!(peer = %peer_id, addr = %address, relayed = is_relayed, "Tracking new peer connection");
        self.peers.insert(peer_id, address);
    }

    /// Remove a peer that has fully disconnected.
    pub fn on_disconnected(&mut self, peer_id: &PeerId) {
        if self.peers.remove(peer_id).is_some() {
            debug!(peer = %peer_id, "Removed peer from tracker");
        }
    }

    /// Record listen addresses a peer announced about itself.
    pub fn learn_addresses(&mut self, peer_id: PeerId, addrs: &[Multiaddr]) {
        let known = self.address_book.entry(peer_id).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Every peer with at least one known address: announced listen
    /// addresses first, then the address of a live connection.
    pub fn known_addresses(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        let mut out: HashMap<PeerId, Vec<Multiaddr>> = self.address_book.clone();
        for (peer_id, address) in &self.peers {
            let addrs = out.entry(*peer_id).or_default();
            if !addrs.contains(address) {
                addrs.push(address.clone());
            }
        }
        out.into_iter().filter(|(_, addrs)| !addrs.is_empty()).collect()
    }

    /// Addresses we can hand out for one peer.
    pub fn addresses_of(&self, peer_id: &PeerId) -> Vec<Multiaddr> {
        let mut addrs = self.address_book.get(peer_id).cloned().unwrap_or_default();
        if let Some(address) = self.peers.get(peer_id) {
            if !addrs.contains(address) {
                addrs.insert(0, address.clone());
            }
        }
        addrs
    }
}
