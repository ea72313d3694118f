//! Chat synchronization: local sends, the receive path with gap recovery,
//! resend service and head announcements.

use std::sync::Arc;
use std::time::Instant;

use chrono::{TimeZone, Utc};
use tracing::{debug, error, info, warn};

use parley_shared::constants::MIME_TEXT;
use parley_shared::protocol::{ChatMessage, ResendRequest};
use parley_shared::{ChatId, DataPacket, MessageId};
use parley_store::{Message, StoreError};

use crate::chat_log::Arrival;
use crate::commands::media::leave_packet;
use crate::error::{NodeError, Result};
use crate::events::NodeEvent;
use crate::orchestrator::Orchestrator;
use crate::session::PeerSession;
use crate::snapshot::ChatView;

pub(crate) fn message_to_wire(message: &Message) -> ChatMessage {
    ChatMessage {
        chat_id: message.chat_id.clone(),
        message_id: message.id.clone(),
        prev_message_id: message.prev.clone(),
        payload: message.text.as_bytes().to_vec(),
        author_id: message.author.clone(),
        mime_type: MIME_TEXT.to_string(),
        sent: message.sent_nanos(),
    }
}

pub(crate) fn message_from_wire(wire: ChatMessage) -> std::result::Result<Message, String> {
    if wire.mime_type != MIME_TEXT {
        return Err(format!("unsupported mime type {}", wire.mime_type));
    }
    let ids_ok = wire.chat_id.is_well_formed()
        && wire.message_id.is_well_formed()
        && wire.prev_message_id.as_ref().map_or(true, MessageId::is_well_formed);
    if !ids_ok {
        return Err("malformed chat or message id".into());
    }
    let text = String::from_utf8(wire.payload).map_err(|_| "payload is not UTF-8".to_string())?;
    Ok(Message {
        id: wire.message_id,
        prev: wire.prev_message_id,
        chat_id: wire.chat_id,
        author: wire.author_id,
        text,
        sent: Utc.timestamp_nanos(wire.sent),
    })
}

impl Orchestrator {
    /// Load the persisted history of `chat` on first use.
    pub(crate) async fn ensure_loaded(&self, chat: &ChatId) -> Result<()> {
        {
            let state = self.state.read().await;
            match state.chats.get(chat) {
                None => return Err(NodeError::UnknownChat(chat.clone())),
                Some(log) if log.is_loaded() => return Ok(()),
                Some(_) => {}
            }
        }

        let messages = self.store.list_messages(chat)?;
        let mut state = self.state.write().await;
        if let Some(log) = state.chats.get_mut(chat) {
            if !log.is_loaded() {
                debug!(chat = %chat, count = messages.len(), "Chat history loaded");
                log.load(messages);
            }
        }
        Ok(())
    }

    /// Open `chat`: load its history, shuffle its peer order and point the
    /// call view at it.
    pub async fn select_chat(&self, chat: &ChatId) -> Result<ChatView> {
        self.ensure_loaded(chat).await?;

        let (view, dropped, sessions) = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            let log = state
                .chats
                .get_mut(chat)
                .ok_or_else(|| NodeError::UnknownChat(chat.clone()))?;
            log.shuffle_peers(&mut rand::thread_rng());
            state.selected = Some(chat.clone());
            let dropped = state.call.bind(chat, log.chat().peers.clone());
            let view = ChatView::from_log(log);
            let sessions: Vec<_> = dropped
                .receiving_from
                .iter()
                .filter_map(|peer| state.sessions.get(peer).cloned())
                .collect();
            (view, dropped, sessions)
        };
        debug!(chat = %chat, "Chat selected");

        if let (Some(previous), false) = (&dropped.chat_id, dropped.receiving_from.is_empty()) {
            debug!(chat = %previous, streams = dropped.receiving_from.len(), "Leaving streams of the previous chat");
            self.broadcast(&sessions, &leave_packet(previous)).await;
            self.events.emit(NodeEvent::CallStateChanged {
                call: self.call_snapshot().await,
            });
        }
        Ok(view)
    }

    /// Persist a new message on top of the chat head, then send it to every
    /// connected member.  A store failure is returned and nothing is sent.
    pub async fn send_message(&self, chat: &ChatId, text: &str) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(NodeError::InvalidInput("message is empty".into()));
        }
        self.ensure_loaded(chat).await?;

        let sending = self.send_lock.lock().await;
        let prev = {
            let state = self.state.read().await;
            let log = state.chats.get(chat).ok_or_else(|| NodeError::UnknownChat(chat.clone()))?;
            log.head().map(|m| m.id.clone())
        };

        let message = Message {
            id: MessageId::new(),
            prev,
            chat_id: chat.clone(),
            author: self.local.clone(),
            text: text.to_string(),
            sent: Utc::now(),
        };
        if let Err(e) = self.store.insert_message(&message) {
            error!(chat = %chat, error = %e, "Failed to persist message");
            return Err(e.into());
        }

        let sessions = {
            let mut state = self.state.write().await;
            if let Some(log) = state.chats.get_mut(chat) {
                log.append(message.clone());
            }
            state.member_sessions(chat, &self.local)
        };
        drop(sending);

        debug!(chat = %chat, id = %message.id, recipients = sessions.len(), "Sending message");
        self.broadcast(&sessions, &DataPacket::Message(message_to_wire(&message)))
            .await;
        self.events.emit(NodeEvent::NewMessage {
            chat_id: chat.clone(),
            message_id: message.id.clone(),
            author: self.local.clone(),
        });
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Session callbacks
    // ------------------------------------------------------------------

    pub(crate) async fn on_message(&self, session: &Arc<PeerSession>, wire: ChatMessage) {
        let from = session.peer();
        let message = match message_from_wire(wire) {
            Ok(message) => message,
            Err(reason) => {
                debug!(peer = %from.short(), reason = %reason, "Message dropped");
                return;
            }
        };

        {
            let state = self.state.read().await;
            let Some(chat) = state.chat(&message.chat_id) else {
                debug!(peer = %from.short(), chat = %message.chat_id, "Message for unknown chat dropped");
                return;
            };
            if !chat.is_member(from) || !chat.is_member(&message.author) {
                warn!(peer = %from.short(), chat = %message.chat_id, "Message from non-member dropped");
                return;
            }
        }
        if let Err(e) = self.ensure_loaded(&message.chat_id).await {
            warn!(chat = %message.chat_id, error = %e, "Could not load chat history");
            return;
        }

        let arrival = {
            let mut state = self.state.write().await;
            let Some(log) = state.chats.get_mut(&message.chat_id) else {
                return;
            };
            let arrival = log.classify(&message);
            if let Arrival::MissingPrev(prev) = &arrival {
                if !log.hold(message.clone()) {
                    warn!(chat = %message.chat_id, id = %message.id, missing = %prev, "Gap buffer full, message dropped");
                    return;
                }
            }
            arrival
        };

        match arrival {
            Arrival::Duplicate => debug!(id = %message.id, "Duplicate message ignored"),
            Arrival::Ready => self.accept_messages(vec![message]).await,
            Arrival::MissingPrev(prev) => {
                debug!(chat = %message.chat_id, id = %message.id, missing = %prev, "Gap detected");
                self.request_resend(session, &message.chat_id, prev).await;
            }
        }
    }

    /// Persist and append messages whose predecessor is known, releasing
    /// whatever waited on them.
    ///
    /// A message that fails to persist is recorded as missing; it and
    /// everything held behind it are asked for again on the next session.
    async fn accept_messages(&self, mut ready: Vec<Message>) {
        while let Some(message) = ready.pop() {
            if let Err(e) = self.store.insert_message(&message) {
                error!(chat = %message.chat_id, id = %message.id, error = %e, "Failed to persist received message");
                if let Some(log) = self.state.write().await.chats.get_mut(&message.chat_id) {
                    log.mark_missing(message.id.clone());
                }
                continue;
            }

            let (appended, released) = {
                let mut state = self.state.write().await;
                match state.chats.get_mut(&message.chat_id) {
                    Some(log) => {
                        if log.append(message.clone()) {
                            (true, log.release(&message.id))
                        } else {
                            (false, Vec::new())
                        }
                    }
                    None => (false, Vec::new()),
                }
            };
            if !appended {
                continue;
            }

            info!(chat = %message.chat_id, id = %message.id, author = %message.author.short(), "Message received");
            self.events.emit(NodeEvent::NewMessage {
                chat_id: message.chat_id.clone(),
                message_id: message.id.clone(),
                author: message.author.clone(),
            });
            ready.extend(released);
        }
    }

    /// Ask the sender for `missing`, falling back to other connected members.
    async fn request_resend(&self, session: &Arc<PeerSession>, chat: &ChatId, missing: MessageId) {
        let packet = DataPacket::ResendRequest(ResendRequest {
            chat_id: chat.clone(),
            message_id: missing,
        });
        if session.send(&packet).await.is_ok() {
            return;
        }

        let fallbacks = self.state.read().await.member_sessions(chat, &self.local);
        for other in fallbacks.iter().filter(|s| s.peer() != session.peer()) {
            if other.send(&packet).await.is_ok() {
                debug!(peer = %other.peer().short(), "Resend request sent to fallback member");
                return;
            }
        }
        warn!(chat = %chat, "No member reachable for resend request");
    }

    pub(crate) async fn on_resend_request(&self, session: &Arc<PeerSession>, request: ResendRequest) {
        let from = session.peer();
        if !request.message_id.is_well_formed() {
            debug!(peer = %from.short(), "Resend request for malformed id ignored");
            return;
        }
        {
            let state = self.state.read().await;
            match state.chat(&request.chat_id) {
                Some(chat) if chat.is_member(from) => {}
                _ => {
                    debug!(peer = %from.short(), chat = %request.chat_id, "Resend request ignored");
                    return;
                }
            }
        }

        let message = match self.store.find_message(&request.chat_id, &request.message_id) {
            Ok(message) => message,
            Err(StoreError::NotFound) => {
                debug!(id = %request.message_id, "Resend request for unknown message ignored");
                return;
            }
            Err(e) => {
                error!(id = %request.message_id, error = %e, "Failed to look up message");
                return;
            }
        };

        debug!(peer = %from.short(), id = %message.id, "Re-sending message");
        if let Err(e) = session.send(&DataPacket::Message(message_to_wire(&message))).await {
            warn!(peer = %from.short(), error = %e, "Re-send failed");
        }
    }

    /// Send the tip of every branch of each chat shared with the session's
    /// peer, then ask it for every id we are still missing there.  The peer
    /// pulls anything older it lacks through resend requests.
    pub(crate) async fn announce_heads(&self, session: &Arc<PeerSession>) {
        let peer = session.peer();
        let chats = self.state.read().await.chats_with(peer);
        for chat in chats {
            if let Err(e) = self.ensure_loaded(&chat).await {
                warn!(chat = %chat, error = %e, "Could not load chat history");
                continue;
            }
            let (leaves, missing) = {
                let mut state = self.state.write().await;
                let Some(log) = state.chats.get_mut(&chat) else {
                    continue;
                };
                let expired = log.expire(Instant::now());
                if expired > 0 {
                    debug!(chat = %chat, expired, "Gave up on stale gaps");
                }
                let leaves: Vec<Message> = log.leaves().into_iter().cloned().collect();
                (leaves, log.missing())
            };

            debug!(peer = %peer.short(), chat = %chat, leaves = leaves.len(), missing = missing.len(), "Announcing chat heads");
            let requests = missing.into_iter().map(|message_id| {
                DataPacket::ResendRequest(ResendRequest {
                    chat_id: chat.clone(),
                    message_id,
                })
            });
            let packets = leaves
                .iter()
                .map(|leaf| DataPacket::Message(message_to_wire(leaf)))
                .chain(requests);
            for packet in packets {
                if let Err(e) = session.send(&packet).await {
                    warn!(peer = %peer.short(), error = %e, "Head announcement failed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::PeerIdentity;

    use super::*;

    #[test]
    fn wire_conversion_keeps_ids_and_time() {
        let message = Message {
            id: MessageId::from("m2"),
            prev: Some(MessageId::from("m1")),
            chat_id: ChatId::from("c1"),
            author: PeerIdentity::from("A"),
            text: "hi".into(),
            sent: Utc.timestamp_nanos(1_700_000_000_123_456_789),
        };
        let restored = message_from_wire(message_to_wire(&message)).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn non_text_payloads_are_rejected() {
        let mut wire = message_to_wire(&Message {
            id: MessageId::from("m1"),
            prev: None,
            chat_id: ChatId::from("c1"),
            author: PeerIdentity::from("A"),
            text: "x".into(),
            sent: Utc::now(),
        });
        wire.mime_type = "image/png".into();
        assert!(message_from_wire(wire.clone()).is_err());

        wire.mime_type = MIME_TEXT.into();
        wire.payload = vec![0xff, 0xfe];
        assert!(message_from_wire(wire).is_err());
    }

    #[test]
    fn ids_with_separators_are_rejected() {
        let message = Message {
            id: MessageId::from("m2"),
            prev: Some(MessageId::from("m1")),
            chat_id: ChatId::from("c1"),
            author: PeerIdentity::from("A"),
            text: "x".into(),
            sent: Utc::now(),
        };
        let mut wire = message_to_wire(&message);
        wire.message_id = MessageId::from("00000000000000000001:m1");
        assert!(message_from_wire(wire).is_err());

        let mut wire = message_to_wire(&message);
        wire.prev_message_id = Some(MessageId::from("a:b"));
        assert!(message_from_wire(wire).is_err());

        let mut wire = message_to_wire(&message);
        wire.chat_id = ChatId::from("c1:m");
        assert!(message_from_wire(wire).is_err());
    }
}
