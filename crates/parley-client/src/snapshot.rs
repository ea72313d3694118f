//! Read-only views handed to the presentation layer.

use serde::Serialize;

use parley_shared::{ChatId, PeerIdentity};
use parley_store::Message;

use crate::chat_log::ChatLog;

#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub id: ChatId,
    pub name: String,
    pub peers: Vec<PeerIdentity>,
    /// Latest message, if history is loaded.
    pub head: Option<Message>,
}

impl ChatSummary {
    pub(crate) fn from_log(log: &ChatLog) -> Self {
        Self {
            id: log.chat().id.clone(),
            name: log.chat().name.clone(),
            peers: log.chat().peers.iter().cloned().collect(),
            head: log.head().cloned(),
        }
    }
}

/// The opened chat.
#[derive(Debug, Clone, Serialize)]
pub struct ChatView {
    pub id: ChatId,
    pub name: String,
    /// Members in this selection's shuffled order.
    pub peers: Vec<PeerIdentity>,
    pub messages: Vec<Message>,
    /// Messages held back until a missing predecessor arrives.
    pub waiting: usize,
}

impl ChatView {
    pub(crate) fn from_log(log: &ChatLog) -> Self {
        Self {
            id: log.chat().id.clone(),
            name: log.chat().name.clone(),
            peers: log.peer_order().to_vec(),
            messages: log.messages(),
            waiting: log.waiting_count(),
        }
    }
}
