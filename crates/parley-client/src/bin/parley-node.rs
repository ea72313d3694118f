//! Headless Parley node.
//!
//! Environment: `PARLEY_DATA_DIR`, `PARLEY_PORT`, `PARLEY_BOOTSTRAP`,
//! `PARLEY_PASSPHRASE` (empty or unset opens a plaintext store), `RUST_LOG`.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use parley_client::{bootstrap, init_tracing, NodeConfig, Orchestrator};
use parley_media::HeadlessPipeline;
use parley_net::spawn_swarm;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = NodeConfig::from_env();
    let passphrase = std::env::var("PARLEY_PASSPHRASE").ok().filter(|p| !p.is_empty());

    let store = bootstrap::open_store(&config, passphrase.as_deref()).context("Failed to open store")?;
    let identity = bootstrap::load_identity(&store).context("Failed to load node key")?;
    let swarm_config = bootstrap::swarm_config(&config, &store);

    let fabric = spawn_swarm(&identity, swarm_config)
        .await
        .context("Failed to start the network")?;
    info!(peer_id = %fabric.local_peer_id(), "Network started");

    let node = Orchestrator::start(config, Arc::new(store), Arc::new(fabric), Arc::new(HeadlessPipeline))
        .await
        .context("Failed to start node")?;

    let mut events = node.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    info!(event = event.name(), %payload, "Node event");
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    node.shutdown().await;
    Ok(())
}
