//! Bootstrap peer loading.
//!
//! Bootstrap addresses come from two places: the `boot:` records the store
//! saved on the last shutdown (handed in as strings) and an optional
//! configuration file with one multiaddr per line.

use std::fs;
use std::path::Path;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, info, warn};

/// Load bootstrap peer multiaddrs from a configuration file.
///
/// Empty lines and lines starting with `#` are ignored; malformed lines are
/// logged and skipped.
///
/// ```text
/// # Parley bootstrap nodes
/// /ip4/198.51.100.10/udp/4001/quic-v1/p2p/12D3KooW...
/// ```
pub fn load_bootstrap_peers(path: &Path) -> Vec<Multiaddr> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read bootstrap peers file");
            return Vec::new();
        }
    };

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    let addrs = parse_multiaddrs(&lines);

    info!(count = addrs.len(), path = %path.display(), "Loaded bootstrap peers");
    addrs
}

/// Parse multiaddr strings, dropping the ones that do not parse.
pub fn parse_multiaddrs(raw: &[String]) -> Vec<Multiaddr> {
    raw.iter()
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Loaded bootstrap peer");
                Some(addr)
            }
            Err(e) => {
                warn!(addr = %s, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

/// Extract the `PeerId` from a multiaddr, if one is present.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Append `/p2p/<peer>` unless the address already names a peer.
pub fn with_peer_id(addr: Multiaddr, peer: PeerId) -> Multiaddr {
    if extract_peer_id(&addr).is_some() {
        addr
    } else {
        addr.with(Protocol::P2p(peer))
    }
}
