//! Node state shared by every operation and session callback.
//!
//! The [`NodeState`] lives behind the orchestrator's single `RwLock`.  It
//! only holds in-memory copies; durable records belong to the store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parley_media::{CallState, CaptureControls};
use parley_shared::{ChatId, PeerIdentity};
use parley_store::{Chat, Contact};

use crate::chat_log::ChatLog;
use crate::session::PeerSession;

pub struct NodeState {
    /// Registered session per peer.  Duplicate streams are served but not
    /// registered.
    pub sessions: HashMap<PeerIdentity, Arc<PeerSession>>,

    pub contacts: BTreeMap<PeerIdentity, Contact>,

    pub chats: BTreeMap<ChatId, ChatLog>,

    /// Chat currently opened by the user.
    pub selected: Option<ChatId>,

    /// The node's only call.
    pub call: CallState,

    /// Contacts with a running address-resolution task.
    pub resolving: HashSet<PeerIdentity>,

    /// Set once shutdown started; no new sessions are registered after it.
    pub shutting_down: bool,
}

impl NodeState {
    pub fn new(contacts: Vec<Contact>, chats: Vec<Chat>, controls: CaptureControls) -> Self {
        Self {
            sessions: HashMap::new(),
            contacts: contacts.into_iter().map(|c| (c.id.clone(), c)).collect(),
            chats: chats.into_iter().map(|c| (c.id.clone(), ChatLog::new(c))).collect(),
            selected: None,
            call: CallState::new(controls),
            resolving: HashSet::new(),
            shutting_down: false,
        }
    }

    pub fn chat(&self, id: &ChatId) -> Option<&Chat> {
        self.chats.get(id).map(ChatLog::chat)
    }

    /// Open sessions to the members of `chat` other than `local`, in the
    /// chat's peer order.
    pub fn member_sessions(&self, chat: &ChatId, local: &PeerIdentity) -> Vec<Arc<PeerSession>> {
        let Some(log) = self.chats.get(chat) else {
            return Vec::new();
        };
        log.peer_order()
            .iter()
            .filter(|peer| *peer != local)
            .filter_map(|peer| self.sessions.get(peer).cloned())
            .collect()
    }

    /// Chats `peer` is a member of.
    pub fn chats_with(&self, peer: &PeerIdentity) -> Vec<ChatId> {
        self.chats
            .values()
            .filter(|log| log.chat().is_member(peer))
            .map(|log| log.chat().id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn chats_with_filters_by_membership() {
        let local = PeerIdentity::from("A");
        let chats = vec![
            Chat {
                id: ChatId::from("ab"),
                name: "ab".into(),
                peers: BTreeSet::from([local.clone(), PeerIdentity::from("B")]),
            },
            Chat {
                id: ChatId::from("ac"),
                name: "ac".into(),
                peers: BTreeSet::from([local.clone(), PeerIdentity::from("C")]),
            },
        ];
        let state = NodeState::new(Vec::new(), chats, CaptureControls::new());
        assert_eq!(state.chats_with(&PeerIdentity::from("B")), vec![ChatId::from("ab")]);
        assert_eq!(state.chats_with(&local).len(), 2);
        assert!(state.member_sessions(&ChatId::from("ab"), &local).is_empty());
    }
}
