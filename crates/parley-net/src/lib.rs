//! Network fabric for Parley nodes.
//!
//! [`NetworkFabric`] is what the session layer consumes: open and accept
//! byte streams per protocol, locate peers, list connections.  Two
//! implementations ship here: [`Libp2pFabric`] (QUIC, Kademlia, relay and
//! hole punching) and the in-process [`memory`] network.

pub mod behaviour;
pub mod discovery;
pub mod error;
pub mod fabric;
pub mod memory;
pub mod peers;
pub mod relay;
pub mod swarm;
pub mod transport;

pub use discovery::load_bootstrap_peers;
pub use error::NetError;
pub use fabric::{BoxedStream, InboundStream, NetworkFabric, PeerStream, RoutingPeer};
pub use memory::{MemoryFabric, MemoryNetwork};
pub use peers::PeerTracker;
pub use swarm::{spawn_swarm, Libp2pFabric, SwarmCommand, SwarmConfig};
pub use transport::{build_swarm, keypair_from_identity};
