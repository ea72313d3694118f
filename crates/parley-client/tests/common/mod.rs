#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_client::{NodeConfig, Orchestrator};
use parley_media::{HeadlessPipeline, MediaPipeline, SyntheticPipeline};
use parley_net::{MemoryNetwork, NetworkFabric};
use parley_shared::crypto::KdfParams;
use parley_shared::{ChatId, PeerIdentity};
use parley_store::{Chat, Contact, Store};

pub const FAST_KDF: KdfParams = KdfParams {
    time_cost: 1,
    memory_kib: 64,
    parallelism: 1,
};

pub fn fast_config() -> NodeConfig {
    NodeConfig {
        data_dir: std::env::temp_dir(),
        heartbeat_interval: Duration::from_millis(100),
        lookup_timeout: Duration::from_secs(5),
        reconnect_delay: Duration::from_millis(50),
        ..NodeConfig::default()
    }
}

pub fn peer(id: &str) -> PeerIdentity {
    PeerIdentity::from(id)
}

pub fn direct_chat(a: &str, b: &str) -> ChatId {
    ChatId::direct(&peer(a), &peer(b))
}

pub fn memory_store() -> Arc<Store> {
    Arc::new(Store::open_in_memory(None, FAST_KDF).unwrap())
}

/// Write `remote` as a contact with its 1:1 chat straight into `store`, as
/// if a previous run had added it.
pub fn seed_contact(store: &Store, local: &str, remote: &str) -> ChatId {
    store.add_contact(&Contact::new(peer(remote), remote)).unwrap();
    let chat = Chat {
        id: direct_chat(local, remote),
        name: remote.to_string(),
        peers: BTreeSet::from([peer(local), peer(remote)]),
    };
    store.create_chat(&chat).unwrap();
    chat.id
}

pub struct TestNode {
    pub node: Arc<Orchestrator>,
    pub store: Arc<Store>,
    pub media: Arc<SyntheticPipeline>,
}

pub async fn start_with(
    net: &Arc<MemoryNetwork>,
    name: &str,
    store: Arc<Store>,
    config: NodeConfig,
    pipeline: Arc<dyn MediaPipeline>,
) -> Arc<Orchestrator> {
    let fabric: Arc<dyn NetworkFabric> = Arc::new(net.join(name));
    Orchestrator::start(config, store, fabric, pipeline).await.unwrap()
}

/// A node with a synthetic camera on `net`.
pub async fn start_node(net: &Arc<MemoryNetwork>, name: &str, store: Arc<Store>) -> TestNode {
    let media = Arc::new(SyntheticPipeline::default());
    let node = start_with(net, name, store.clone(), fast_config(), media.clone()).await;
    TestNode { node, store, media }
}

pub async fn start_headless(net: &Arc<MemoryNetwork>, name: &str, store: Arc<Store>, config: NodeConfig) -> Arc<Orchestrator> {
    start_with(net, name, store, config, Arc::new(HeadlessPipeline)).await
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_connected(a: &Orchestrator, b: &Orchestrator) {
    let (pa, pb) = (a.local_peer().clone(), b.local_peer().clone());
    let (pa, pb) = (&pa, &pb);
    eventually("session between nodes", || async move {
        a.connected_peers().await.contains(pb) && b.connected_peers().await.contains(pa)
    })
    .await;
}
