//! The libp2p swarm task and the fabric handle that drives it.
//!
//! The swarm event loop runs in a dedicated tokio task.  [`Libp2pFabric`]
//! talks to it through a typed command channel; protocol streams bypass the
//! loop entirely through a cloned `libp2p_stream::Control`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    identify, kad,
    multiaddr::Protocol,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    Multiaddr, PeerId, StreamProtocol,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

use parley_shared::constants::DEFAULT_QUIC_PORT;
use parley_shared::identity::Identity;
use parley_shared::PeerIdentity;

use crate::behaviour::{ParleyBehaviour, ParleyBehaviourEvent};
use crate::discovery::{extract_peer_id, load_bootstrap_peers, parse_multiaddrs, with_peer_id};
use crate::error::NetError;
use crate::fabric::{BoxedStream, InboundStream, NetworkFabric, RoutingPeer};
use crate::peers::PeerTracker;
use crate::relay::{circuit_listen_addr, relayed_addr};
use crate::transport::{build_swarm, keypair_from_identity};

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Dial a peer, optionally teaching the routing table some addresses first.
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    /// Resolve a peer's addresses; replies once it is reachable.
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Snapshot of currently connected peers.
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    /// Snapshot of every peer with a known address.
    GetRoutingPeers(oneshot::Sender<Vec<(PeerId, Vec<Multiaddr>)>>),
    /// Gracefully shut down the swarm.
    Shutdown,
}

/// Configuration for spawning the swarm.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Port to listen on (defaults to `DEFAULT_QUIC_PORT`).
    pub listen_port: u16,
    /// Path to a bootstrap peers file.
    pub bootstrap_peers_path: Option<PathBuf>,
    /// Addresses remembered from the previous run.
    pub bootstrap_addrs: Vec<String>,
    /// Relay addresses (`.../p2p/<relay>`) to reserve circuits on.
    pub relays: Vec<String>,
    /// Additional multiaddrs to dial on startup.
    pub extra_dials: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_peers_path: None,
            bootstrap_addrs: Vec::new(),
            relays: Vec::new(),
            extra_dials: Vec::new(),
        }
    }
}

/// Handle to a running libp2p swarm.
pub struct Libp2pFabric {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    control: libp2p_stream::Control,
    ready: watch::Receiver<bool>,
}

/// Build the swarm for `identity`, start listening, dial bootstrap peers and
/// spawn the event loop.
pub async fn spawn_swarm(identity: &Identity, config: SwarmConfig) -> Result<Libp2pFabric, NetError> {
    let mut swarm = build_swarm(keypair_from_identity(identity)?)?;
    let local_peer_id = *swarm.local_peer_id();
    let control = swarm.behaviour().stream.new_control();

    let listen_v4: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port)
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| NetError::Transport(e.to_string()))?;
    let listen_v6: Multiaddr = format!("/ip6/::/udp/{}/quic-v1", config.listen_port)
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| NetError::Transport(e.to_string()))?;
    swarm
        .listen_on(listen_v4)
        .map_err(|e| NetError::Transport(e.to_string()))?;
    if let Err(e) = swarm.listen_on(listen_v6) {
        warn!(error = %e, "IPv6 listen failed");
    }
    info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm listening");

    let relays = parse_multiaddrs(&config.relays);
    for relay in &relays {
        match circuit_listen_addr(relay) {
            Some(circuit) => {
                if let Err(e) = swarm.listen_on(circuit.clone()) {
                    warn!(addr = %circuit, error = %e, "Relay reservation failed");
                }
            }
            None => warn!(addr = %relay, "Relay address has no /p2p component, ignored"),
        }
    }

    let mut bootstrap = parse_multiaddrs(&config.bootstrap_addrs);
    if let Some(ref path) = config.bootstrap_peers_path {
        bootstrap.extend(load_bootstrap_peers(path));
    }
    for addr in &bootstrap {
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
        }
        match swarm.dial(addr.clone()) {
            Ok(()) => debug!(addr = %addr, "Dialing bootstrap peer"),
            Err(e) => warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer"),
        }
    }
    if !bootstrap.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "Kademlia bootstrap failed to start");
        }
    }

    for addr in &config.extra_dials {
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial extra address");
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (ready_tx, ready_rx) = watch::channel(false);

    tokio::spawn(run_event_loop(swarm, cmd_rx, ready_tx, relays));

    Ok(Libp2pFabric {
        local_peer_id,
        cmd_tx,
        control,
        ready: ready_rx,
    })
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingRequests {
    dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), NetError>>>>,
    lookups: HashMap<PeerId, Vec<oneshot::Sender<Vec<Multiaddr>>>>,
    lookup_queries: HashMap<kad::QueryId, PeerId>,
}

async fn run_event_loop(
    mut swarm: libp2p::Swarm<ParleyBehaviour>,
    mut cmd_rx: mpsc::Receiver<SwarmCommand>,
    ready: watch::Sender<bool>,
    relays: Vec<Multiaddr>,
) {
    let mut tracker = PeerTracker::new();
    let mut pending = PendingRequests::default();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SwarmCommand::Dial { peer, addrs, reply }) => {
                        if tracker.is_connected(&peer) {
                            let _ = reply.send(Ok(()));
                            continue;
                        }
                        for addr in addrs {
                            swarm.behaviour_mut().kademlia.add_address(&peer, addr);
                        }
                        match dial_peer(&mut swarm, peer, &relays) {
                            Ok(()) => pending.dials.entry(peer).or_default().push(reply),
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Some(SwarmCommand::FindPeer { peer, reply }) => {
                        let known = tracker.addresses_of(&peer);
                        if !known.is_empty() {
                            let _ = reply.send(known);
                            continue;
                        }
                        let waiting = pending.lookups.entry(peer).or_default();
                        waiting.retain(|tx| !tx.is_closed());
                        waiting.push(reply);
                        let query = swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                        pending.lookup_queries.insert(query, peer);
                        debug!(peer = %peer, "Started peer lookup");
                    }
                    Some(SwarmCommand::GetPeers(reply)) => {
                        let _ = reply.send(tracker.connected_peers());
                    }
                    Some(SwarmCommand::GetRoutingPeers(reply)) => {
                        let _ = reply.send(tracker.known_addresses());
                    }
                    Some(SwarmCommand::Shutdown) => {
                        info!("Swarm shutdown requested");
                        break;
                    }
                    None => {
                        info!("Command channel closed, shutting down swarm");
                        break;
                    }
                }
            }

            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::Behaviour(ParleyBehaviourEvent::Kademlia(
                        kad::Event::OutboundQueryProgressed { id, result, .. },
                    )) => match result {
                        kad::QueryResult::GetClosestPeers(result) => {
                            let Some(peer) = pending.lookup_queries.remove(&id) else {
                                continue;
                            };
                            debug!(peer = %peer, ok = result.is_ok(), "Peer lookup finished");
                            if pending.lookups.contains_key(&peer) && !tracker.is_connected(&peer) {
                                if let Err(e) = dial_peer(&mut swarm, peer, &relays) {
                                    debug!(peer = %peer, error = %e, "Looked-up peer is not dialable yet");
                                }
                            }
                        }
                        kad::QueryResult::Bootstrap(Ok(_)) => {
                            if !*ready.borrow() {
                                info!("Routing table bootstrapped");
                            }
                            ready.send_replace(true);
                        }
                        other => debug!(result = ?other, "Kademlia query progressed"),
                    },

                    SwarmEvent::Behaviour(ParleyBehaviourEvent::Identify(
                        identify::Event::Received { peer_id, info, .. },
                    )) => {
                        debug!(peer = %peer_id, protocol = ?info.protocol_version, "Identify: received info from peer");
                        for addr in &info.listen_addrs {
                            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                        }
                        tracker.learn_addresses(peer_id, &info.listen_addrs);
                    }

                    SwarmEvent::Behaviour(ParleyBehaviourEvent::RelayClient(event)) => {
                        debug!(event = ?event, "Relay client event");
                    }

                    SwarmEvent::Behaviour(ParleyBehaviourEvent::Dcutr(event)) => {
                        debug!(event = ?event, "DCUtR event");
                    }

                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        let addr = endpoint.get_remote_address().clone();
                        let is_relayed = addr.iter().any(|p| matches!(p, Protocol::P2pCircuit));
                        tracker.on_connected(peer_id, addr.clone(), is_relayed);
                        info!(peer = %peer_id, addr = %addr, relayed = is_relayed, "Peer connected");

                        ready.send_replace(true);
                        for reply in pending.dials.remove(&peer_id).unwrap_or_default() {
                            let _ = reply.send(Ok(()));
                        }
                        let known = tracker.addresses_of(&peer_id);
                        for reply in pending.lookups.remove(&peer_id).unwrap_or_default() {
                            let _ = reply.send(known.clone());
                        }
                    }

                    SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                        if num_established == 0 {
                            tracker.on_disconnected(&peer_id);
                            info!(peer = %peer_id, "Peer disconnected");
                        }
                    }

                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(addr = %address, "Listening on new address");
                    }

                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        if let Some(peer) = peer_id {
                            for reply in pending.dials.remove(&peer).unwrap_or_default() {
                                let _ = reply.send(Err(NetError::Dial {
                                    peer: peer.to_string(),
                                    reason: error.to_string(),
                                }));
                            }
                        }
                    }

                    SwarmEvent::IncomingConnectionError { error, .. } => {
                        warn!(error = %error, "Incoming connection error");
                    }

                    _ => {}
                }
            }
        }
    }

    info!("Swarm event loop terminated");
}

/// Dial by peer id using whatever addresses the behaviours know, falling
/// back to circuits through the configured relays.
fn dial_peer(
    swarm: &mut libp2p::Swarm<ParleyBehaviour>,
    peer: PeerId,
    relays: &[Multiaddr],
) -> Result<(), NetError> {
    let direct_err = match swarm.dial(peer) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    let circuits: Vec<Multiaddr> = relays
        .iter()
        .filter_map(|relay| extract_peer_id(relay).map(|relay_id| relayed_addr(relay, &relay_id, &peer)))
        .collect();
    if circuits.is_empty() {
        return Err(NetError::Dial {
            peer: peer.to_string(),
            reason: direct_err.to_string(),
        });
    }

    debug!(peer = %peer, relays = circuits.len(), "Dialing peer via relay");
    swarm
        .dial(DialOpts::peer_id(peer).addresses(circuits).build())
        .map_err(|e| NetError::Dial {
            peer: peer.to_string(),
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Fabric handle
// ---------------------------------------------------------------------------

fn to_peer_id(peer: &PeerIdentity) -> Result<PeerId, NetError> {
    peer.as_str()
        .parse::<PeerId>()
        .map_err(|_| NetError::InvalidPeerId(peer.to_string()))
}

fn to_identity(peer: &PeerId) -> PeerIdentity {
    PeerIdentity::new(peer.to_string())
}

impl Libp2pFabric {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand) -> Result<T, NetError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| NetError::ChannelClosed)?;
        rx.await.map_err(|_| NetError::ChannelClosed)
    }
}

#[async_trait]
impl NetworkFabric for Libp2pFabric {
    fn local_peer(&self) -> PeerIdentity {
        to_identity(&self.local_peer_id)
    }

    async fn connect(&self, peer: &PeerIdentity, hints: &[String]) -> Result<(), NetError> {
        let peer_id = to_peer_id(peer)?;
        let addrs = parse_multiaddrs(hints)
            .into_iter()
            .map(|addr| with_peer_id(addr, peer_id))
            .collect();
        self.request(|reply| SwarmCommand::Dial {
            peer: peer_id,
            addrs,
            reply,
        })
        .await?
    }

    async fn open_stream(&self, peer: &PeerIdentity, protocol: &'static str) -> Result<BoxedStream, NetError> {
        let peer_id = to_peer_id(peer)?;
        let stream = self
            .control
            .clone()
            .open_stream(peer_id, StreamProtocol::new(protocol))
            .await
            .map_err(|e| NetError::OpenStream {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream.compat()))
    }

    async fn accept_streams(&self, protocol: &'static str) -> Result<mpsc::Receiver<InboundStream>, NetError> {
        let mut incoming = self
            .control
            .clone()
            .accept(StreamProtocol::new(protocol))
            .map_err(|_| NetError::AlreadyRegistered(protocol.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                debug!(peer = %peer, protocol, "Inbound stream");
                let boxed: BoxedStream = Box::new(stream.compat());
                if tx.send((to_identity(&peer), boxed)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn find_peer(&self, peer: &PeerIdentity, timeout: Duration) -> Result<Vec<String>, NetError> {
        let peer_id = to_peer_id(peer)?;
        let lookup = self.request(|reply| SwarmCommand::FindPeer { peer: peer_id, reply });
        let addrs = tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| NetError::LookupTimeout(peer.to_string()))??;
        Ok(addrs.iter().map(ToString::to_string).collect())
    }

    async fn connected_peers(&self) -> Result<Vec<PeerIdentity>, NetError> {
        let peers = self.request(SwarmCommand::GetPeers).await?;
        Ok(peers.iter().map(to_identity).collect())
    }

    async fn wait_ready(&self) -> Result<(), NetError> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| NetError::ChannelClosed)
    }

    async fn routing_peers(&self) -> Result<Vec<RoutingPeer>, NetError> {
        let known = self.request(SwarmCommand::GetRoutingPeers).await?;
        Ok(known
            .into_iter()
            .map(|(peer, addrs)| RoutingPeer {
                id: to_identity(&peer),
                addresses: addrs.iter().map(ToString::to_string).collect(),
            })
            .collect())
    }

    async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SwarmCommand::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_conversion_round_trips() {
        let peer = PeerId::random();
        let identity = to_identity(&peer);
        assert_eq!(to_peer_id(&identity).unwrap(), peer);
        assert!(matches!(
            to_peer_id(&PeerIdentity::from("not-a-peer")),
            Err(NetError::InvalidPeerId(_))
        ));
    }

    #[tokio::test]
    async fn swarm_starts_and_reports_itself() {
        let identity = Identity::generate();
        let config = SwarmConfig {
            listen_port: 0,
            ..SwarmConfig::default()
        };
        let fabric = spawn_swarm(&identity, config).await.unwrap();

        let expected = keypair_from_identity(&identity).unwrap().public().to_peer_id();
        assert_eq!(fabric.local_peer_id(), expected);
        assert!(fabric.connected_peers().await.unwrap().is_empty());
        assert!(fabric.routing_peers().await.unwrap().is_empty());

        fabric.shutdown().await;
    }
}
