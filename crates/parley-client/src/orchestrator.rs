//! The node orchestrator.
//!
//! One [`Orchestrator`] per node owns the session table, the contact and chat
//! caches and the call state behind a single `RwLock`.  The lock guards
//! in-memory critical sections only: store calls and network writes happen
//! after it is released.
//!
//! User-facing operations live in [`crate::commands`], grouped the same way
//! the session callbacks are.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_media::{CallSnapshot, CaptureControls, MediaPipeline};
use parley_net::NetworkFabric;
use parley_shared::constants::CHAT_PROTOCOL;
use parley_shared::{ChatId, DataPacket, PeerIdentity};
use parley_store::{BootstrapPeer, Contact, Message, Store};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::session::{PeerSession, SessionHandler};
use crate::snapshot::{ChatSummary, ChatView};
use crate::state::NodeState;

pub struct Orchestrator {
    pub(crate) local: PeerIdentity,
    pub(crate) config: NodeConfig,
    pub(crate) store: Arc<Store>,
    pub(crate) fabric: Arc<dyn NetworkFabric>,
    pub(crate) pipeline: Arc<dyn MediaPipeline>,
    pub(crate) state: RwLock<NodeState>,
    pub(crate) events: EventBus,
    /// Parent of every background task and session.
    pub(crate) root: CancellationToken,
    /// Serializes local sends so two of them never claim the same head.
    pub(crate) send_lock: Mutex<()>,
    /// Held while announcing call presence, so no `Active` follows a `Stop`.
    pub(crate) signal_lock: Mutex<()>,
    pub(crate) next_session: AtomicU64,
    me: Weak<Self>,
}

impl Orchestrator {
    /// Load the caches, register the chat protocol handler and start
    /// resolving every known contact.
    pub async fn start(
        config: NodeConfig,
        store: Arc<Store>,
        fabric: Arc<dyn NetworkFabric>,
        pipeline: Arc<dyn MediaPipeline>,
    ) -> Result<Arc<Self>> {
        let local = fabric.local_peer();
        let contacts = store.list_contacts()?;
        let chats = store.list_chats()?;
        let inbound = fabric.accept_streams(CHAT_PROTOCOL).await?;

        info!(
            peer = %local,
            contacts = contacts.len(),
            chats = chats.len(),
            "Starting node"
        );

        let contact_ids: Vec<PeerIdentity> = contacts.iter().map(|c| c.id.clone()).collect();
        let node = Arc::new_cyclic(|me| Self {
            local,
            config,
            store,
            fabric,
            pipeline,
            state: RwLock::new(NodeState::new(contacts, chats, CaptureControls::new())),
            events: EventBus::new(),
            root: CancellationToken::new(),
            send_lock: Mutex::new(()),
            signal_lock: Mutex::new(()),
            next_session: AtomicU64::new(1),
            me: me.clone(),
        });

        node.spawn_acceptor(inbound);
        for peer in contact_ids {
            node.spawn_resolution(peer).await;
        }
        Ok(node)
    }

    /// Strong handle for spawning tasks from `&self` methods.
    pub(crate) fn handle(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    pub fn local_peer(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.root.is_cancelled()
    }

    /// Leave any call, remember routing peers for the next start, close all
    /// sessions and stop the fabric.
    pub async fn shutdown(&self) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.leave_call().await {
            debug!(error = %e, "No call to leave on shutdown");
        }

        self.state.write().await.shutting_down = true;

        match self.fabric.routing_peers().await {
            Ok(peers) => {
                let boot: Vec<BootstrapPeer> = peers
                    .into_iter()
                    .filter(|p| !p.addresses.is_empty())
                    .map(|p| BootstrapPeer {
                        id: p.id,
                        addresses: p.addresses,
                    })
                    .collect();
                match self.store.save_bootstrap_peers(&boot) {
                    Ok(()) => info!(count = boot.len(), "Saved bootstrap peers"),
                    Err(e) => warn!(error = %e, "Failed to save bootstrap peers"),
                }
            }
            Err(e) => warn!(error = %e, "Could not read routing peers"),
        }

        self.root.cancel();
        self.fabric.shutdown().await;
        info!(peer = %self.local, "Node stopped");
    }

    /// Write `packet` to every session, logging failures.
    pub(crate) async fn broadcast(&self, sessions: &[Arc<PeerSession>], packet: &DataPacket) {
        let sends = sessions.iter().map(|session| async move {
            if let Err(e) = session.send(packet).await {
                warn!(peer = %session.peer().short(), kind = packet.kind(), error = %e, "Send failed");
            }
        });
        futures::future::join_all(sends).await;
    }

    pub(crate) async fn session(&self, peer: &PeerIdentity) -> Option<Arc<PeerSession>> {
        self.state.read().await.sessions.get(peer).cloned()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub async fn contacts(&self) -> Vec<Contact> {
        self.state.read().await.contacts.values().cloned().collect()
    }

    pub async fn chats(&self) -> Vec<ChatSummary> {
        let state = self.state.read().await;
        state.chats.values().map(ChatSummary::from_log).collect()
    }

    pub async fn selected_chat(&self) -> Option<ChatView> {
        let state = self.state.read().await;
        let id = state.selected.as_ref()?;
        state.chats.get(id).map(ChatView::from_log)
    }

    /// Messages of `chat` in display order, loading history if needed.
    pub async fn messages(&self, chat: &ChatId) -> Result<Vec<Message>> {
        self.ensure_loaded(chat).await?;
        let state = self.state.read().await;
        let log = state.chats.get(chat).ok_or_else(|| NodeError::UnknownChat(chat.clone()))?;
        Ok(log.messages())
    }

    pub async fn call_snapshot(&self) -> CallSnapshot {
        self.state.read().await.call.snapshot()
    }

    /// Peers with a registered session.
    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        let state = self.state.read().await;
        let mut peers: Vec<_> = state.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }
}

#[async_trait]
impl SessionHandler for Orchestrator {
    async fn on_packet(&self, session: &Arc<PeerSession>, packet: DataPacket) {
        match packet {
            DataPacket::Ping => self.on_ping(session).await,
            DataPacket::Pong => {}
            DataPacket::ResendRequest(request) => self.on_resend_request(session, request).await,
            DataPacket::Message(message) => self.on_message(session, message).await,
            DataPacket::StreamChunk(chunk) => self.on_stream_chunk(session, chunk).await,
            DataPacket::StreamStatus(update) => self.on_stream_status(session, update).await,
            DataPacket::StreamJoinResponse(response) => self.on_stream_join_response(session, response).await,
        }
    }

    async fn on_closed(&self, session: &Arc<PeerSession>) {
        self.on_session_closed(session).await;
    }
}
