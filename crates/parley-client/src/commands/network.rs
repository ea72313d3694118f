//! Sessions and reachability: the inbound stream acceptor, per-contact
//! address resolution, session registration and teardown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_net::{BoxedStream, InboundStream};
use parley_shared::constants::CHAT_PROTOCOL;
use parley_shared::{DataPacket, PeerIdentity};
use parley_store::StoreError;

use crate::error::{NodeError, Result};
use crate::events::NodeEvent;
use crate::orchestrator::Orchestrator;
use crate::session::{self, PeerSession, SessionHandler};

impl Orchestrator {
    /// Serve every stream the fabric hands us for the chat protocol.
    pub(crate) fn spawn_acceptor(&self, mut inbound: mpsc::Receiver<InboundStream>) {
        let Some(node) = self.handle() else { return };
        let cancel = self.root.clone();

        tokio::spawn(async move {
            loop {
                let (peer, stream) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = inbound.recv() => match next {
                        Some(inbound) => inbound,
                        None => break,
                    },
                };
                debug!(peer = %peer.short(), "Inbound stream");
                node.attach_stream(peer, stream).await;
            }
            debug!("Stream acceptor stopped");
        });
    }

    /// Start a session over `stream`.  The first live session per peer is
    /// registered; later ones are served without registration.
    pub(crate) async fn attach_stream(&self, peer: PeerIdentity, stream: BoxedStream) -> Option<Arc<PeerSession>> {
        if peer == self.local {
            warn!("Refusing a stream from ourselves");
            return None;
        }
        let node = self.handle()?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (session, reader) = PeerSession::new(id, peer.clone(), stream, self.root.child_token());

        let registered = {
            let mut state = self.state.write().await;
            if state.shutting_down {
                session.close();
                return None;
            }
            match state.sessions.get(&peer) {
                Some(existing) if !existing.is_closed() => false,
                _ => {
                    state.sessions.insert(peer.clone(), session.clone());
                    true
                }
            }
        };

        let handler: Arc<dyn SessionHandler> = node;
        tokio::spawn(session::run(session.clone(), reader, handler));

        if registered {
            info!(peer = %peer, session = id, "Session opened");
            self.events.emit(NodeEvent::PeerConnected { peer_id: peer.clone() });
            self.on_session_opened(&session).await;
        } else {
            debug!(peer = %peer.short(), session = id, "Serving duplicate stream");
        }
        Some(session)
    }

    async fn on_session_opened(&self, session: &Arc<PeerSession>) {
        let peer = session.peer();
        match self.store.touch_contact(peer, Utc::now()) {
            Ok(contact) => {
                self.state.write().await.contacts.insert(peer.clone(), contact);
            }
            Err(StoreError::NotFound) => debug!(peer = %peer.short(), "Session with a peer that is not a contact"),
            Err(e) => warn!(peer = %peer.short(), error = %e, "Failed to update contact"),
        }
        self.announce_heads(session).await;
    }

    pub(crate) async fn on_session_closed(&self, session: &Arc<PeerSession>) {
        let peer = session.peer();
        let (registered, roster) = {
            let mut state = self.state.write().await;
            let registered = state.sessions.get(peer).map(|s| s.id()) == Some(session.id());
            if registered {
                state.sessions.remove(peer);
                let changed = state.call.peer_gone(peer);
                let roster = changed
                    .then(|| state.call.chat_id().cloned().map(|chat| (chat, state.call.roster())))
                    .flatten();
                (true, roster)
            } else {
                (false, None)
            }
        };

        if !registered {
            debug!(peer = %peer.short(), session = session.id(), "Duplicate stream closed");
            return;
        }
        info!(peer = %peer, session = session.id(), "Session closed");
        self.events.emit(NodeEvent::PeerDisconnected { peer_id: peer.clone() });
        if let Some((chat_id, roster)) = roster {
            self.events.emit(NodeEvent::CallRosterChanged { chat_id, roster });
        }
    }

    pub(crate) async fn on_ping(&self, session: &Arc<PeerSession>) {
        if let Err(e) = session.send(&DataPacket::Pong).await {
            debug!(peer = %session.peer().short(), error = %e, "Pong failed");
        }
    }

    // ------------------------------------------------------------------
    // Address resolution
    // ------------------------------------------------------------------

    /// Keep a session with `peer` alive: once the fabric is ready, look the
    /// peer up, connect and open the chat stream; after the session ends,
    /// start over.  At most one task per peer.
    pub(crate) async fn spawn_resolution(&self, peer: PeerIdentity) {
        if peer == self.local {
            return;
        }
        let Some(node) = self.handle() else { return };
        if !self.state.write().await.resolving.insert(peer.clone()) {
            return;
        }
        let cancel = self.root.child_token();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = node.resolve_loop(&peer) => {}
            }
            node.state.write().await.resolving.remove(&peer);
            debug!(peer = %peer.short(), "Address resolution stopped");
        });
    }

    async fn resolve_loop(&self, peer: &PeerIdentity) {
        if let Err(e) = self.fabric.wait_ready().await {
            warn!(error = %e, "Fabric never became ready");
            return;
        }

        loop {
            if let Some(session) = self.session(peer).await {
                session.closed().await;
                tokio::time::sleep(self.config.reconnect_delay).await;
                continue;
            }
            if let Err(e) = self.dial_contact(peer).await {
                debug!(peer = %peer.short(), error = %e, "Peer not reachable yet");
                tokio::time::sleep(self.config.reconnect_delay).await;
            }
        }
    }

    async fn dial_contact(&self, peer: &PeerIdentity) -> Result<Arc<PeerSession>> {
        let mut hints = {
            let state = self.state.read().await;
            state.contacts.get(peer).map(|c| c.addresses.clone()).unwrap_or_default()
        };

        match self.fabric.find_peer(peer, self.config.lookup_timeout).await {
            Ok(found) => {
                if let Some(best) = found.first() {
                    if hints.first() != Some(best) {
                        self.remember_address(peer, best).await;
                    }
                }
                for addr in found.into_iter().rev() {
                    if !hints.contains(&addr) {
                        hints.insert(0, addr);
                    }
                }
            }
            Err(e) if hints.is_empty() => return Err(e.into()),
            Err(e) => debug!(peer = %peer.short(), error = %e, "Lookup failed, trying stored addresses"),
        }

        self.fabric.connect(peer, &hints).await?;
        let stream = self.fabric.open_stream(peer, CHAT_PROTOCOL).await?;
        self.attach_stream(peer.clone(), stream).await.ok_or(NodeError::ShuttingDown)
    }

    async fn remember_address(&self, peer: &PeerIdentity, address: &str) {
        match self.store.remember_contact_address(peer, address) {
            Ok(contact) => {
                self.state.write().await.contacts.insert(peer.clone(), contact);
            }
            Err(e) => debug!(peer = %peer.short(), error = %e, "Address not remembered"),
        }
    }
}
