//! In-process fabric.
//!
//! A [`MemoryNetwork`] is a switchboard shared by any number of nodes; each
//! node gets a [`MemoryFabric`] handle.  Streams are `tokio::io::duplex`
//! pipes, so the session layer above runs exactly as it does over libp2p.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use parley_shared::PeerIdentity;

use crate::error::NetError;
use crate::fabric::{BoxedStream, InboundStream, NetworkFabric, RoutingPeer};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct Switchboard {
    /// Registered nodes and their per-protocol stream handlers.
    nodes: HashMap<PeerIdentity, HashMap<&'static str, mpsc::Sender<InboundStream>>>,
    /// Undirected links created by `connect` or `open_stream`.
    links: HashSet<(PeerIdentity, PeerIdentity)>,
}

impl Switchboard {
    fn link(&mut self, a: &PeerIdentity, b: &PeerIdentity) {
        let key = if a <= b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
        self.links.insert(key);
    }
}

/// Shared in-memory network.
#[derive(Default)]
pub struct MemoryNetwork {
    board: Mutex<Switchboard>,
    joined: Notify,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node to the network.
    pub fn join(self: &Arc<Self>, peer: impl Into<PeerIdentity>) -> MemoryFabric {
        let peer = peer.into();
        if let Ok(mut board) = self.board.lock() {
            board.nodes.entry(peer.clone()).or_default();
        }
        self.joined.notify_waiters();
        debug!(peer = %peer, "Node joined memory network");
        MemoryFabric {
            network: Arc::clone(self),
            local: peer,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Switchboard>, NetError> {
        self.board.lock().map_err(|_| NetError::ChannelClosed)
    }
}

/// Handle for one node on a [`MemoryNetwork`].
pub struct MemoryFabric {
    network: Arc<MemoryNetwork>,
    local: PeerIdentity,
}

#[async_trait]
impl NetworkFabric for MemoryFabric {
    fn local_peer(&self) -> PeerIdentity {
        self.local.clone()
    }

    async fn connect(&self, peer: &PeerIdentity, _hints: &[String]) -> Result<(), NetError> {
        let mut board = self.network.lock()?;
        if !board.nodes.contains_key(peer) {
            return Err(NetError::Dial {
                peer: peer.to_string(),
                reason: "peer is not on the network".into(),
            });
        }
        board.link(&self.local, peer);
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerIdentity, protocol: &'static str) -> Result<BoxedStream, NetError> {
        let handler = {
            let mut board = self.network.lock()?;
            let handler = board
                .nodes
                .get(peer)
                .and_then(|handlers| handlers.get(protocol))
                .cloned()
                .ok_or_else(|| NetError::OpenStream {
                    peer: peer.to_string(),
                    reason: format!("no handler for {protocol}"),
                })?;
            board.link(&self.local, peer);
            handler
        };

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound: BoxedStream = Box::new(theirs);
        handler
            .send((self.local.clone(), inbound))
            .await
            .map_err(|_| NetError::OpenStream {
                peer: peer.to_string(),
                reason: "handler closed".into(),
            })?;
        Ok(Box::new(ours))
    }

    async fn accept_streams(&self, protocol: &'static str) -> Result<mpsc::Receiver<InboundStream>, NetError> {
        let (tx, rx) = mpsc::channel(64);
        let mut board = self.network.lock()?;
        let handlers = board.nodes.entry(self.local.clone()).or_default();
        match handlers.get(protocol) {
            Some(existing) if !existing.is_closed() => {
                return Err(NetError::AlreadyRegistered(protocol.to_string()))
            }
            _ => {
                handlers.insert(protocol, tx);
            }
        }
        Ok(rx)
    }

    async fn find_peer(&self, peer: &PeerIdentity, timeout: Duration) -> Result<Vec<String>, NetError> {
        let lookup = async {
            loop {
                let joined = self.network.joined.notified();
                let present = match self.network.lock() {
                    Ok(board) => board.nodes.contains_key(peer),
                    Err(e) => return Err(e),
                };
                if present {
                    return Ok(vec![format!("/memory/{peer}")]);
                }
                joined.await;
            }
        };
        tokio::time::timeout(timeout, lookup)
            .await
            .map_err(|_| NetError::LookupTimeout(peer.to_string()))?
    }

    async fn connected_peers(&self) -> Result<Vec<PeerIdentity>, NetError> {
        let board = self.network.lock()?;
        Ok(board
            .links
            .iter()
            .filter_map(|(a, b)| {
                let other = if *a == self.local { b } else if *b == self.local { a } else { return None };
                board.nodes.contains_key(other).then(|| other.clone())
            })
            .collect())
    }

    async fn wait_ready(&self) -> Result<(), NetError> {
        Ok(())
    }

    async fn routing_peers(&self) -> Result<Vec<RoutingPeer>, NetError> {
        Ok(self
            .connected_peers()
            .await?
            .into_iter()
            .map(|id| RoutingPeer {
                addresses: vec![format!("/memory/{id}")],
                id,
            })
            .collect())
    }

    /// Leave the network; this node's handlers are dropped.
    async fn shutdown(&self) {
        if let Ok(mut board) = self.network.lock() {
            board.nodes.remove(&self.local);
            let local = self.local.clone();
            board.links.retain(|(a, b)| *a != local && *b != local);
        }
    }
}
