//! Contact directory and chat creation.

use std::collections::BTreeSet;

use tracing::info;

use parley_shared::{ChatId, PeerIdentity};
use parley_store::{Chat, Contact};

use crate::chat_log::ChatLog;
use crate::error::{NodeError, Result};
use crate::events::NodeEvent;
use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Add a contact and its 1:1 chat, then start looking the peer up.
    ///
    /// Both sides derive the same chat id, so whoever adds whom first the
    /// two nodes end up in one chat.  An existing contact is left untouched.
    pub async fn add_contact(&self, id: PeerIdentity, alias: &str, addresses: Vec<String>) -> Result<Contact> {
        if id == self.local {
            return Err(NodeError::InvalidInput("cannot add yourself as a contact".into()));
        }
        if id.as_str().is_empty() {
            return Err(NodeError::InvalidInput("empty peer id".into()));
        }
        let alias = match alias.trim() {
            "" => id.short().to_string(),
            alias => alias.to_string(),
        };

        let mut contact = Contact::new(id.clone(), alias.clone());
        contact.addresses = addresses;
        if !self.store.add_contact(&contact)? {
            return Err(NodeError::ContactExists(id));
        }

        let chat = Chat {
            id: ChatId::direct(&self.local, &id),
            name: alias,
            peers: BTreeSet::from([self.local.clone(), id.clone()]),
        };
        let created = !self.store.chat_exists(&chat.id)?;
        if created {
            self.store.create_chat(&chat)?;
        }

        {
            let mut state = self.state.write().await;
            state.contacts.insert(id.clone(), contact.clone());
            if !state.chats.contains_key(&chat.id) {
                state.chats.insert(chat.id.clone(), ChatLog::new(chat.clone()));
            }
        }
        info!(peer = %id, chat = %chat.id, "Contact added");

        self.events.emit(NodeEvent::ContactAdded { peer_id: id.clone() });
        if created {
            self.events.emit(NodeEvent::ChatCreated { chat_id: chat.id });
        }
        self.spawn_resolution(id).await;
        Ok(contact)
    }

    /// Create a group chat with a fresh id.  Every member must be a contact.
    pub async fn create_group_chat(&self, name: &str, members: &[PeerIdentity]) -> Result<Chat> {
        self.install_group_chat(ChatId::new_group(), name, members).await
    }

    /// Register a group chat created elsewhere, using the id its creator
    /// shared.  The member list must match the creator's.
    pub async fn join_group_chat(&self, id: ChatId, name: &str, members: &[PeerIdentity]) -> Result<Chat> {
        if !id.is_well_formed() {
            return Err(NodeError::InvalidInput(format!("malformed chat id {id:?}")));
        }
        self.install_group_chat(id, name, members).await
    }

    async fn install_group_chat(&self, id: ChatId, name: &str, members: &[PeerIdentity]) -> Result<Chat> {
        let name = name.trim();
        if name.is_empty() {
            return Err(NodeError::InvalidInput("chat name is empty".into()));
        }

        let mut peers = BTreeSet::from([self.local.clone()]);
        {
            let state = self.state.read().await;
            if state.chats.contains_key(&id) {
                return Err(NodeError::InvalidInput(format!("chat {id} already exists")));
            }
            for member in members.iter().filter(|m| **m != self.local) {
                if !state.contacts.contains_key(member) {
                    return Err(NodeError::UnknownContact(member.clone()));
                }
                peers.insert(member.clone());
            }
        }
        if peers.len() < 2 {
            return Err(NodeError::InvalidInput("a chat needs at least one other member".into()));
        }

        let chat = Chat {
            id,
            name: name.to_string(),
            peers,
        };
        self.store.create_chat(&chat)?;
        self.state
            .write()
            .await
            .chats
            .insert(chat.id.clone(), ChatLog::new(chat.clone()));

        info!(chat = %chat.id, members = chat.peers.len(), "Group chat created");
        self.events.emit(NodeEvent::ChatCreated {
            chat_id: chat.id.clone(),
        });
        Ok(chat)
    }
}
