use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::discovery::extract_peer_id;

/// Listen address that asks `relay_addr` for a circuit reservation:
/// `<relay_addr>/p2p/<relay>/p2p-circuit`.
///
/// Returns `None` when the relay address does not name the relay peer.
pub fn circuit_listen_addr(relay_addr: &Multiaddr) -> Option<Multiaddr> {
    extract_peer_id(relay_addr)?;
    Some(relay_addr.clone().with(Protocol::P2pCircuit))
}

/// `<relay_addr>/p2p/<relay>/p2p-circuit/p2p/<target>`
pub fn relayed_addr(relay_addr: &Multiaddr, relay_peer_id: &PeerId, target: &PeerId) -> Multiaddr {
    let base = if extract_peer_id(relay_addr).is_some() {
        relay_addr.clone()
    } else {
        relay_addr.clone().with(Protocol::P2p(*relay_peer_id))
    };
    base.with(Protocol::P2pCircuit).with(Protocol::P2p(*target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_needs_relay_peer() {
        let bare: Multiaddr = "/ip4/10.0.0.1/udp/4001/quic-v1".parse().unwrap();
        assert!(circuit_listen_addr(&bare).is_none());

        let relay = PeerId::random();
        let named = bare.clone().with(Protocol::P2p(relay));
        let circuit = circuit_listen_addr(&named).unwrap();
        assert!(circuit.iter().any(|p| matches!(p, Protocol::P2pCircuit)));
    }

    #[test]
    fn relayed_dial_addr_ends_with_target() {
        let relay = PeerId::random();
        let target = PeerId::random();
        let base: Multiaddr = "/ip4/10.0.0.1/udp/4001/quic-v1".parse().unwrap();

        let addr = relayed_addr(&base, &relay, &target);
        assert_eq!(addr.iter().last(), Some(Protocol::P2p(target)));
    }
}
