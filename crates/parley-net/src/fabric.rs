//! The capability the session layer consumes from the network.
//!
//! A fabric opens and accepts ordered byte streams to and from peer
//! identities, and locates peers.  [`crate::Libp2pFabric`] runs on a real
//! libp2p swarm; [`crate::memory::MemoryNetwork`] wires nodes together
//! in-process.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use parley_shared::PeerIdentity;

use crate::error::NetError;

/// A bidirectional byte stream to one peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn PeerStream>;

/// A stream opened by a remote peer.
pub type InboundStream = (PeerIdentity, BoxedStream);

/// A peer from the routing table with its last known addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPeer {
    pub id: PeerIdentity,
    pub addresses: Vec<String>,
}

#[async_trait]
pub trait NetworkFabric: Send + Sync + 'static {
    /// Identity of this node on the network.
    fn local_peer(&self) -> PeerIdentity;

    /// Establish a connection, using `hints` as candidate addresses.
    async fn connect(&self, peer: &PeerIdentity, hints: &[String]) -> Result<(), NetError>;

    /// Open a new stream to `peer` speaking `protocol`.
    async fn open_stream(
        &self,
        peer: &PeerIdentity,
        protocol: &'static str,
    ) -> Result<BoxedStream, NetError>;

    /// Register as the handler for `protocol`; inbound streams arrive on the
    /// returned receiver.  Only one handler per protocol.
    async fn accept_streams(
        &self,
        protocol: &'static str,
    ) -> Result<mpsc::Receiver<InboundStream>, NetError>;

    /// Locate `peer` and return its address hints, bounded by `timeout`.
    async fn find_peer(&self, peer: &PeerIdentity, timeout: Duration)
        -> Result<Vec<String>, NetError>;

    async fn connected_peers(&self) -> Result<Vec<PeerIdentity>, NetError>;

    /// Resolves once the node has joined the routing network.
    async fn wait_ready(&self) -> Result<(), NetError>;

    /// Peers worth remembering for the next start.
    async fn routing_peers(&self) -> Result<Vec<RoutingPeer>, NetError>;

    /// Stop the fabric. Open streams are closed.
    async fn shutdown(&self);
}
