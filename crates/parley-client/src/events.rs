//! Notifications for the presentation layer.
//!
//! The node publishes [`NodeEvent`]s on a broadcast channel; subscribers
//! re-read the snapshots they care about when an event arrives.

use serde::Serialize;
use tokio::sync::broadcast;

use parley_media::CallSnapshot;
use parley_shared::{ChatId, MessageId, PeerIdentity};

pub const EVENT_NEW_MESSAGE: &str = "new-message";
pub const EVENT_PEER_CONNECTED: &str = "peer-connected";
pub const EVENT_PEER_DISCONNECTED: &str = "peer-disconnected";
pub const EVENT_CONTACT_ADDED: &str = "contact-added";
pub const EVENT_CHAT_CREATED: &str = "chat-created";
pub const EVENT_CALL_STATE_CHANGED: &str = "call-state-changed";
pub const EVENT_CALL_ROSTER_CHANGED: &str = "call-roster-changed";

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NodeEvent {
    NewMessage {
        chat_id: ChatId,
        message_id: MessageId,
        author: PeerIdentity,
    },
    PeerConnected {
        peer_id: PeerIdentity,
    },
    PeerDisconnected {
        peer_id: PeerIdentity,
    },
    ContactAdded {
        peer_id: PeerIdentity,
    },
    ChatCreated {
        chat_id: ChatId,
    },
    CallStateChanged {
        call: CallSnapshot,
    },
    CallRosterChanged {
        chat_id: ChatId,
        roster: Vec<PeerIdentity>,
    },
}

impl NodeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::NewMessage { .. } => EVENT_NEW_MESSAGE,
            NodeEvent::PeerConnected { .. } => EVENT_PEER_CONNECTED,
            NodeEvent::PeerDisconnected { .. } => EVENT_PEER_DISCONNECTED,
            NodeEvent::ContactAdded { .. } => EVENT_CONTACT_ADDED,
            NodeEvent::ChatCreated { .. } => EVENT_CHAT_CREATED,
            NodeEvent::CallStateChanged { .. } => EVENT_CALL_STATE_CHANGED,
            NodeEvent::CallRosterChanged { .. } => EVENT_CALL_ROSTER_CHANGED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event.  Having no subscriber is not an error.
    pub fn emit(&self, event: NodeEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(NodeEvent::PeerConnected {
            peer_id: PeerIdentity::from("B"),
        });
        bus.emit(NodeEvent::PeerDisconnected {
            peer_id: PeerIdentity::from("B"),
        });

        assert_eq!(rx.recv().await.unwrap().name(), EVENT_PEER_CONNECTED);
        assert_eq!(rx.recv().await.unwrap().name(), EVENT_PEER_DISCONNECTED);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventBus::new().emit(NodeEvent::ChatCreated {
            chat_id: ChatId::from("c1"),
        });
    }

    #[test]
    fn events_serialize_with_their_name() {
        let event = NodeEvent::ChatCreated {
            chat_id: ChatId::from("c1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], EVENT_CHAT_CREATED);
    }
}
