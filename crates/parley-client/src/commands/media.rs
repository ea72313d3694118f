//! Calls: joining and leaving, stream subscriptions, capture controls and
//! the call signaling callbacks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_media::{CallSnapshot, ChunkOutcome, EncodedChunk, JoinDecision, RelayTask, RosterChange};
use parley_shared::protocol::{JoinAnswer, StreamChunk, StreamJoinResponse, StreamStatus, StreamStatusUpdate};
use parley_shared::{ChatId, DataPacket, PeerIdentity};

use crate::error::{NodeError, Result};
use crate::events::NodeEvent;
use crate::orchestrator::Orchestrator;
use crate::session::PeerSession;

impl Orchestrator {
    /// Join the call of the selected chat.
    ///
    /// Without a capture device the call is entered receive-only when the
    /// configuration allows it.
    pub async fn join_call(&self) -> Result<CallSnapshot> {
        let (chat, members, current, controls) = {
            let state = self.state.read().await;
            let chat_id = state.selected.clone().ok_or(NodeError::NoChatSelected)?;
            let chat = state
                .chat(&chat_id)
                .ok_or_else(|| NodeError::UnknownChat(chat_id.clone()))?;
            let current = state.call.in_call().then(|| state.call.chat_id().cloned()).flatten();
            (chat_id, chat.peers.clone(), current, state.call.controls().clone())
        };

        match current {
            Some(current) if current == chat => return Ok(self.call_snapshot().await),
            Some(_) => {
                self.leave_call().await?;
            }
            None => {}
        }

        let capture = match self.pipeline.start_capture(controls).await {
            Ok(rx) => Some(rx),
            Err(e) if self.config.allow_receive_only => {
                warn!(error = %e, "No capture available, joining receive-only");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let (tasks, snapshot) = {
            let mut state = self.state.write().await;
            let tasks = state.call.begin(&chat, members, capture.is_some(), &self.root);
            (tasks, state.call.snapshot())
        };

        if let Some(rx) = capture {
            self.spawn_capture_pump(rx, tasks.clone());
            self.spawn_heartbeat(chat.clone(), tasks);
        }

        info!(chat = %chat, phase = ?snapshot.phase, "Call joined");
        self.events.emit(NodeEvent::CallStateChanged { call: snapshot.clone() });
        Ok(snapshot)
    }

    /// Leave the call: announce `Stop`, send `Leave` to every peer we were
    /// receiving, stop capture and cancel the call's tasks.
    pub async fn leave_call(&self) -> Result<CallSnapshot> {
        let (end, snapshot) = {
            let mut state = self.state.write().await;
            let end = state.call.end();
            (end, state.call.snapshot())
        };
        let chat = end.chat_id.ok_or(NodeError::NotInCall)?;

        if end.was_streaming {
            self.pipeline.stop_capture().await;
        }

        let sessions = self.state.read().await.member_sessions(&chat, &self.local);
        let stop = DataPacket::StreamStatus(StreamStatusUpdate {
            chat_id: chat.clone(),
            status: StreamStatus::Stop,
        });
        {
            let _signal = self.signal_lock.lock().await;
            self.broadcast(&sessions, &stop).await;
        }

        let leave = leave_packet(&chat);
        let receiving: Vec<_> = sessions
            .into_iter()
            .filter(|s| end.receiving_from.contains(s.peer()))
            .collect();
        self.broadcast(&receiving, &leave).await;

        info!(chat = %chat, "Call left");
        self.events.emit(NodeEvent::CallStateChanged { call: snapshot.clone() });
        Ok(snapshot)
    }

    /// Start receiving `peer`'s stream in the current chat.
    pub async fn join_stream(&self, peer: &PeerIdentity) -> Result<CallSnapshot> {
        let (chat, session) = {
            let state = self.state.read().await;
            let chat = state.call.chat_id().cloned().ok_or(NodeError::NoChatSelected)?;
            let session = state
                .sessions
                .get(peer)
                .cloned()
                .ok_or_else(|| NodeError::NotConnected(peer.clone()))?;
            (chat, session)
        };

        let cancel = self.root.child_token();
        let sink = match self.pipeline.start_playback(peer, cancel.clone()) {
            Ok(sink) => sink,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };
        if let Err(e) = self.state.write().await.call.subscribe(peer, sink, cancel.clone()) {
            cancel.cancel();
            return Err(e.into());
        }

        let enter = DataPacket::StreamJoinResponse(StreamJoinResponse {
            chat_id: chat.clone(),
            answer: JoinAnswer::Enter,
        });
        if let Err(e) = session.send(&enter).await {
            self.state.write().await.call.unsubscribe(peer);
            return Err(e);
        }

        info!(peer = %peer.short(), chat = %chat, "Joined stream");
        let snapshot = self.call_snapshot().await;
        self.events.emit(NodeEvent::CallStateChanged { call: snapshot.clone() });
        Ok(snapshot)
    }

    /// Stop receiving `peer`'s stream.  Returns `false` if we were not.
    pub async fn leave_stream(&self, peer: &PeerIdentity) -> Result<bool> {
        let (removed, chat, session) = {
            let mut state = self.state.write().await;
            let removed = state.call.unsubscribe(peer);
            (removed, state.call.chat_id().cloned(), state.sessions.get(peer).cloned())
        };
        if !removed {
            return Ok(false);
        }

        if let (Some(chat), Some(session)) = (chat, session) {
            session.send(&leave_packet(&chat)).await?;
        }
        info!(peer = %peer.short(), "Left stream");
        self.events.emit(NodeEvent::CallStateChanged {
            call: self.call_snapshot().await,
        });
        Ok(true)
    }

    pub async fn set_muted(&self, muted: bool) -> CallSnapshot {
        let snapshot = {
            let state = self.state.read().await;
            state.call.controls().set_muted(muted);
            state.call.snapshot()
        };
        self.events.emit(NodeEvent::CallStateChanged { call: snapshot.clone() });
        snapshot
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> CallSnapshot {
        let snapshot = {
            let state = self.state.read().await;
            state.call.controls().set_video_enabled(enabled);
            state.call.snapshot()
        };
        self.events.emit(NodeEvent::CallStateChanged { call: snapshot.clone() });
        snapshot
    }

    // ------------------------------------------------------------------
    // Call tasks
    // ------------------------------------------------------------------

    /// Announce our stream to every connected chat member until the call
    /// ends.  The first tick fires immediately.
    fn spawn_heartbeat(&self, chat: ChatId, tasks: CancellationToken) {
        let Some(node) = self.handle() else { return };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.heartbeat_interval);
            let active = DataPacket::StreamStatus(StreamStatusUpdate {
                chat_id: chat.clone(),
                status: StreamStatus::Active,
            });
            loop {
                tokio::select! {
                    _ = tasks.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let _signal = node.signal_lock.lock().await;
                // `end()` cancels before `Stop` is sent under the same lock.
                if tasks.is_cancelled() {
                    break;
                }
                let sessions = node.state.read().await.member_sessions(&chat, &node.local);
                trace!(chat = %chat, peers = sessions.len(), "Call heartbeat");
                node.broadcast(&sessions, &active).await;
            }
            debug!(chat = %chat, "Call heartbeat stopped");
        });
    }

    /// Number encoded chunks and queue them for every receiving peer.
    fn spawn_capture_pump(&self, mut capture: mpsc::Receiver<EncodedChunk>, tasks: CancellationToken) {
        let Some(node) = self.handle() else { return };
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = tasks.cancelled() => break,
                    chunk = capture.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => {
                            warn!("Capture pipeline closed");
                            break;
                        }
                    },
                };
                node.state.write().await.call.push_local_chunk(chunk);
            }
            debug!("Capture pump stopped");
        });
    }

    /// Drain one receiving peer's queue into its session.
    fn spawn_relay(&self, task: RelayTask) {
        let Some(node) = self.handle() else { return };
        let RelayTask { peer, mut queue, cancel } = task;
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = queue.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                let Some(session) = node.session(&peer).await else {
                    debug!(peer = %peer.short(), "Relay target has no session");
                    break;
                };
                if let Err(e) = session.send(&DataPacket::StreamChunk(chunk)).await {
                    warn!(peer = %peer.short(), error = %e, "Relay write failed");
                    break;
                }
            }
            debug!(peer = %peer.short(), "Relay stopped");
        });
    }

    // ------------------------------------------------------------------
    // Session callbacks
    // ------------------------------------------------------------------

    pub(crate) async fn on_stream_status(&self, session: &Arc<PeerSession>, update: StreamStatusUpdate) {
        let (change, roster) = {
            let mut state = self.state.write().await;
            let change = state.call.on_stream_status(session.peer(), &update);
            (change, state.call.roster())
        };
        match change {
            RosterChange::Joined | RosterChange::Left => {
                debug!(peer = %session.peer().short(), ?change, "Call roster changed");
                self.events.emit(NodeEvent::CallRosterChanged {
                    chat_id: update.chat_id,
                    roster,
                });
            }
            RosterChange::Unchanged => {}
            RosterChange::Ignored => {
                trace!(peer = %session.peer().short(), chat = %update.chat_id, "Stream status ignored");
            }
        }
    }

    pub(crate) async fn on_stream_join_response(&self, session: &Arc<PeerSession>, response: StreamJoinResponse) {
        let decision = self
            .state
            .write()
            .await
            .call
            .on_join_response(session.peer(), &response);
        match decision {
            JoinDecision::Admitted(task) => {
                self.spawn_relay(task);
                self.events.emit(NodeEvent::CallStateChanged {
                    call: self.call_snapshot().await,
                });
            }
            JoinDecision::Removed { outgoing, incoming } => {
                if outgoing || incoming {
                    self.events.emit(NodeEvent::CallStateChanged {
                        call: self.call_snapshot().await,
                    });
                }
            }
            JoinDecision::Rejected(reason) => {
                debug!(peer = %session.peer().short(), reason, "Join response rejected");
            }
        }
    }

    pub(crate) async fn on_stream_chunk(&self, session: &Arc<PeerSession>, chunk: StreamChunk) {
        let outcome = self.state.write().await.call.on_chunk(session.peer(), chunk);
        if outcome == ChunkOutcome::NotSubscribed {
            trace!(peer = %session.peer().short(), "Chunk from unsubscribed stream");
        }
    }
}

pub(crate) fn leave_packet(chat: &ChatId) -> DataPacket {
    DataPacket::StreamJoinResponse(StreamJoinResponse {
        chat_id: chat.clone(),
        answer: JoinAnswer::Leave,
    })
}
