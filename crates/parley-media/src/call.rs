//! Call signaling and relay state.
//!
//! One [`CallState`] exists per node.  It is a plain state machine: callers
//! feed it local actions and remote signaling, and it answers with what the
//! caller has to do on the network (spawn a relay writer, send `Leave`, ...).
//! Its methods never block, so it can live behind the node's state lock.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_shared::protocol::{JoinAnswer, StreamChunk, StreamJoinResponse, StreamStatus, StreamStatusUpdate};
use parley_shared::{ChatId, PeerIdentity};

use crate::controls::CaptureControls;
use crate::error::MediaError;
use crate::pipeline::EncodedChunk;

/// Chunks buffered per receiving peer before new chunks are dropped.
pub const RELAY_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallPhase {
    Idle,
    /// Joined and sending our own stream.
    Streaming,
    /// Joined without a capture device.
    ReceiveOnly,
}

struct OutgoingRelay {
    queue: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
}

/// Work the caller must run to feed one receiving peer: drain `queue` into
/// that peer's session until `cancel` fires.
#[derive(Debug)]
pub struct RelayTask {
    pub peer: PeerIdentity,
    pub queue: mpsc::Receiver<StreamChunk>,
    pub cancel: CancellationToken,
}

struct IncomingStream {
    cancel: CancellationToken,
    sink: mpsc::Sender<EncodedChunk>,
    last_seq: Option<u64>,
}

/// Effect of a `StreamStatus` on the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Joined,
    Left,
    Unchanged,
    /// Other chat or non-member.
    Ignored,
}

#[derive(Debug)]
pub enum JoinDecision {
    /// The peer now receives our stream.
    Admitted(RelayTask),
    /// The peer stopped receiving our stream and/or we stopped receiving theirs.
    Removed { outgoing: bool, incoming: bool },
    /// Dropped without reply.
    Rejected(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Delivered,
    /// Delivered after `missing` sequence numbers never arrived.
    Gap { missing: u64 },
    /// Sequence number at or below one already seen; delivered anyway.
    Repeated,
    /// Playback queue full or gone.
    Dropped,
    /// We are not receiving this peer's stream.
    NotSubscribed,
}

/// What a caller must announce after leaving a call.
#[derive(Debug, Default)]
pub struct CallEnd {
    pub chat_id: Option<ChatId>,
    pub was_streaming: bool,
    /// Peers whose streams we were receiving; each gets a `Leave`.
    pub receiving_from: Vec<PeerIdentity>,
}

/// Read-only view for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub chat_id: Option<ChatId>,
    pub phase: CallPhase,
    pub muted: bool,
    pub video_enabled: bool,
    pub roster: Vec<PeerIdentity>,
    pub outgoing: Vec<PeerIdentity>,
    pub incoming: Vec<PeerIdentity>,
    pub sequence: u64,
    pub has_init_segment: bool,
}

pub struct CallState {
    chat_id: Option<ChatId>,
    members: BTreeSet<PeerIdentity>,
    phase: CallPhase,
    /// Remote peers announcing an active stream in the bound chat.
    roster: BTreeSet<PeerIdentity>,
    outgoing: HashMap<PeerIdentity, OutgoingRelay>,
    incoming: HashMap<PeerIdentity, IncomingStream>,
    init_segment: Option<StreamChunk>,
    sequence: u64,
    controls: CaptureControls,
    tasks: Option<CancellationToken>,
}

impl CallState {
    pub fn new(controls: CaptureControls) -> Self {
        Self {
            chat_id: None,
            members: BTreeSet::new(),
            phase: CallPhase::Idle,
            roster: BTreeSet::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            init_segment: None,
            sequence: 0,
            controls,
            tasks: None,
        }
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn in_call(&self) -> bool {
        self.phase != CallPhase::Idle
    }

    pub fn controls(&self) -> &CaptureControls {
        &self.controls
    }

    /// Point the call UI at `chat`.  Ignored while in a call.
    ///
    /// Moving to another chat drops the streams received in the previous
    /// one; the returned [`CallEnd`] names them so the caller can send
    /// `Leave`.
    pub fn bind(&mut self, chat: &ChatId, members: BTreeSet<PeerIdentity>) -> CallEnd {
        if self.in_call() {
            return CallEnd::default();
        }
        let mut dropped = CallEnd::default();
        if self.chat_id.as_ref() != Some(chat) {
            dropped.receiving_from = self.cancel_incoming();
            dropped.chat_id = self.chat_id.replace(chat.clone());
            self.roster.clear();
        }
        self.members = members;
        dropped
    }

    /// Enter the call for `chat`.  Returns the token owning every task of
    /// this call (heartbeat, capture pump, relay writers).
    pub fn begin(
        &mut self,
        chat: &ChatId,
        members: BTreeSet<PeerIdentity>,
        streaming: bool,
        parent: &CancellationToken,
    ) -> CancellationToken {
        if self.in_call() {
            self.end();
        }
        self.bind(chat, members);
        self.phase = if streaming { CallPhase::Streaming } else { CallPhase::ReceiveOnly };
        self.sequence = 0;
        self.init_segment = None;
        let tasks = parent.child_token();
        self.tasks = Some(tasks.clone());
        info!(chat = %chat, phase = ?self.phase, "Joined call");
        tasks
    }

    /// Leave the call and release every stream registration.
    pub fn end(&mut self) -> CallEnd {
        if let Some(tasks) = self.tasks.take() {
            tasks.cancel();
        }
        for (_, relay) in self.outgoing.drain() {
            relay.cancel.cancel();
        }
        let receiving_from = self.cancel_incoming();
        let was_streaming = self.phase == CallPhase::Streaming;
        let had_call = self.in_call();

        self.phase = CallPhase::Idle;
        self.init_segment = None;
        self.sequence = 0;
        if had_call {
            info!(chat = ?self.chat_id, "Left call");
        }

        CallEnd {
            chat_id: had_call.then(|| self.chat_id.clone()).flatten(),
            was_streaming,
            receiving_from,
        }
    }

    fn cancel_incoming(&mut self) -> Vec<PeerIdentity> {
        self.incoming
            .drain()
            .map(|(peer, stream)| {
                stream.cancel.cancel();
                peer
            })
            .collect()
    }

    fn is_bound_member(&self, chat: &ChatId, peer: &PeerIdentity) -> bool {
        self.chat_id.as_ref() == Some(chat) && self.members.contains(peer)
    }

    // ------------------------------------------------------------------
    // Local stream
    // ------------------------------------------------------------------

    /// Number and fan out one locally encoded chunk.  The first init chunk
    /// (and any later replacement) is cached for peers that join later.
    ///
    /// Returns the number of peers the chunk was queued for, or `None` if we
    /// are not streaming.
    pub fn push_local_chunk(&mut self, chunk: EncodedChunk) -> Option<usize> {
        if self.phase != CallPhase::Streaming {
            return None;
        }
        let chat_id = self.chat_id.clone()?;

        let packet = StreamChunk {
            chat_id,
            seq: self.sequence,
            is_init: chunk.is_init,
            data: chunk.data,
        };
        self.sequence += 1;
        if packet.is_init {
            debug!(seq = packet.seq, len = packet.data.len(), "Caching init segment");
            self.init_segment = Some(packet.clone());
        }

        let mut queued = 0;
        let mut closed = Vec::new();
        for (peer, relay) in &self.outgoing {
            match relay.queue.try_send(packet.clone()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(peer = %peer.short(), seq = packet.seq, "Relay queue full, dropping chunk");
                }
                Err(TrySendError::Closed(_)) => closed.push(peer.clone()),
            }
        }
        for peer in closed {
            if let Some(relay) = self.outgoing.remove(&peer) {
                relay.cancel.cancel();
            }
        }
        Some(queued)
    }

    // ------------------------------------------------------------------
    // Remote signaling
    // ------------------------------------------------------------------

    pub fn on_stream_status(&mut self, from: &PeerIdentity, update: &StreamStatusUpdate) -> RosterChange {
        if !self.is_bound_member(&update.chat_id, from) {
            return RosterChange::Ignored;
        }
        match update.status {
            StreamStatus::Active => {
                if self.roster.insert(from.clone()) {
                    debug!(peer = %from.short(), "Peer is streaming");
                    RosterChange::Joined
                } else {
                    RosterChange::Unchanged
                }
            }
            StreamStatus::Stop => {
                let listed = self.roster.remove(from);
                let receiving = match self.incoming.remove(from) {
                    Some(stream) => {
                        stream.cancel.cancel();
                        true
                    }
                    None => false,
                };
                if listed || receiving {
                    debug!(peer = %from.short(), "Peer stopped streaming");
                    RosterChange::Left
                } else {
                    RosterChange::Unchanged
                }
            }
        }
    }

    pub fn on_join_response(&mut self, from: &PeerIdentity, response: &StreamJoinResponse) -> JoinDecision {
        if !self.is_bound_member(&response.chat_id, from) {
            return JoinDecision::Rejected("not a member of the call chat");
        }
        match response.answer {
            JoinAnswer::Enter => {
                if self.phase != CallPhase::Streaming {
                    return JoinDecision::Rejected("not streaming");
                }
                if let Some(old) = self.outgoing.remove(from) {
                    old.cancel.cancel();
                }

                let (queue, rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
                if let Some(init) = &self.init_segment {
                    // Fresh queue, so this cannot fail.
                    let _ = queue.try_send(init.clone());
                }
                let cancel = match &self.tasks {
                    Some(tasks) => tasks.child_token(),
                    None => CancellationToken::new(),
                };
                self.outgoing.insert(
                    from.clone(),
                    OutgoingRelay {
                        queue,
                        cancel: cancel.clone(),
                    },
                );
                info!(peer = %from.short(), init = self.init_segment.is_some(), "Peer joined our stream");
                JoinDecision::Admitted(RelayTask {
                    peer: from.clone(),
                    queue: rx,
                    cancel,
                })
            }
            JoinAnswer::Leave => {
                let outgoing = match self.outgoing.remove(from) {
                    Some(relay) => {
                        relay.cancel.cancel();
                        true
                    }
                    None => false,
                };
                let incoming = match self.incoming.remove(from) {
                    Some(stream) => {
                        stream.cancel.cancel();
                        true
                    }
                    None => false,
                };
                debug!(peer = %from.short(), outgoing, incoming, "Peer left our stream");
                JoinDecision::Removed { outgoing, incoming }
            }
        }
    }

    /// Hand a remote chunk to playback.  Loss and repeats are detected from
    /// `seq` and logged; nothing is reordered or discarded here.
    pub fn on_chunk(&mut self, from: &PeerIdentity, chunk: StreamChunk) -> ChunkOutcome {
        if self.chat_id.as_ref() != Some(&chunk.chat_id) {
            return ChunkOutcome::NotSubscribed;
        }
        let Some(stream) = self.incoming.get_mut(from) else {
            return ChunkOutcome::NotSubscribed;
        };

        let outcome = match stream.last_seq {
            Some(last) if chunk.seq <= last => ChunkOutcome::Repeated,
            Some(last) if chunk.seq > last + 1 => ChunkOutcome::Gap {
                missing: chunk.seq - last - 1,
            },
            _ => ChunkOutcome::Delivered,
        };
        match outcome {
            ChunkOutcome::Repeated => debug!(peer = %from.short(), seq = chunk.seq, "Repeated chunk"),
            ChunkOutcome::Gap { missing } => {
                debug!(peer = %from.short(), seq = chunk.seq, missing, "Chunks lost")
            }
            _ => {}
        }
        stream.last_seq = Some(stream.last_seq.map_or(chunk.seq, |last| last.max(chunk.seq)));

        let encoded = EncodedChunk {
            is_init: chunk.is_init,
            data: chunk.data,
        };
        match stream.sink.try_send(encoded) {
            Ok(()) => outcome,
            Err(_) => {
                warn!(peer = %from.short(), seq = chunk.seq, "Playback queue unavailable, chunk dropped");
                ChunkOutcome::Dropped
            }
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Start receiving `peer`'s stream into `sink`.  The caller sends `Enter`.
    pub fn subscribe(
        &mut self,
        peer: &PeerIdentity,
        sink: mpsc::Sender<EncodedChunk>,
        cancel: CancellationToken,
    ) -> Result<(), MediaError> {
        if self.chat_id.is_none() {
            return Err(MediaError::NotInCall);
        }
        if !self.members.contains(peer) {
            return Err(MediaError::WrongChat);
        }
        if let Some(old) = self.incoming.insert(
            peer.clone(),
            IncomingStream {
                cancel,
                sink,
                last_seq: None,
            },
        ) {
            old.cancel.cancel();
        }
        Ok(())
    }

    /// Stop receiving `peer`'s stream.  The caller sends `Leave`.
    pub fn unsubscribe(&mut self, peer: &PeerIdentity) -> bool {
        match self.incoming.remove(peer) {
            Some(stream) => {
                stream.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// The session with `peer` ended: it left every stream.
    pub fn peer_gone(&mut self, peer: &PeerIdentity) -> bool {
        let mut changed = self.roster.remove(peer);
        if let Some(relay) = self.outgoing.remove(peer) {
            relay.cancel.cancel();
            changed = true;
        }
        changed |= self.unsubscribe(peer);
        changed
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn roster(&self) -> Vec<PeerIdentity> {
        self.roster.iter().cloned().collect()
    }

    pub fn outgoing_peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<_> = self.outgoing.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn incoming_peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<_> = self.incoming.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn init_segment(&self) -> Option<&StreamChunk> {
        self.init_segment.as_ref()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            chat_id: self.chat_id.clone(),
            phase: self.phase,
            muted: self.controls.is_muted(),
            video_enabled: self.controls.is_video_enabled(),
            roster: self.roster(),
            outgoing: self.outgoing_peers(),
            incoming: self.incoming_peers(),
            sequence: self.sequence,
            has_init_segment: self.init_segment.is_some(),
        }
    }
}
