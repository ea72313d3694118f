//! Chat headers and membership.

use std::collections::BTreeSet;

use parley_shared::{ChatId, PeerIdentity};

use crate::database::Store;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::models::{Chat, ChatHeader};

impl Store {
    /// Persist a chat header and its member set in one transaction.
    pub fn create_chat(&self, chat: &Chat) -> Result<()> {
        let mut entries = Vec::with_capacity(chat.peers.len() + 1);
        entries.push((keys::chat(&chat.id), serde_json::to_vec(&chat.header())?));
        for peer in &chat.peers {
            entries.push((keys::member(&chat.id, peer), Vec::new()));
        }
        self.put_batch(&entries)
    }

    pub fn chat_exists(&self, id: &ChatId) -> Result<bool> {
        self.contains(&keys::chat(id))
    }

    pub fn get_chat_header(&self, id: &ChatId) -> Result<ChatHeader> {
        self.get_json(&keys::chat(id))
    }

    /// Members of a chat, read from the `member:` marker keys.
    pub fn chat_members(&self, id: &ChatId) -> Result<BTreeSet<PeerIdentity>> {
        let prefix = keys::members_of(id);
        self.scan_prefix_keys(&prefix)?
            .into_iter()
            .map(|key| -> Result<PeerIdentity> {
                key.strip_prefix(&prefix)
                    .map(PeerIdentity::from)
                    .ok_or(StoreError::MalformedKey(key.clone()))
            })
            .collect()
    }

    pub fn get_chat(&self, id: &ChatId) -> Result<Chat> {
        let header = self.get_chat_header(id)?;
        Ok(Chat {
            peers: self.chat_members(id)?,
            id: header.id,
            name: header.name,
        })
    }

    /// Every chat with its members, ordered by chat id.
    pub fn list_chats(&self) -> Result<Vec<Chat>> {
        let headers = self
            .scan_prefix(keys::CHAT_PREFIX)?
            .into_iter()
            .map(|(_, value)| -> Result<ChatHeader> { Ok(serde_json::from_slice(&value)?) })
            .collect::<Result<Vec<_>>>()?;

        headers
            .into_iter()
            .map(|header| -> Result<Chat> {
                Ok(Chat {
                    peers: self.chat_members(&header.id)?,
                    id: header.id,
                    name: header.name,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::crypto::KdfParams;

    use super::*;

    const FAST: KdfParams = KdfParams {
        time_cost: 1,
        memory_kib: 64,
        parallelism: 1,
    };

    fn chat(id: &str, name: &str, peers: &[&str]) -> Chat {
        Chat {
            id: ChatId::from(id),
            name: name.to_string(),
            peers: peers.iter().map(|p| PeerIdentity::from(*p)).collect(),
        }
    }

    #[test]
    fn create_and_read_back() {
        let store = Store::open_in_memory(Some("pw"), FAST).unwrap();
        let c1 = chat("c1", "bob", &["A", "B"]);
        store.create_chat(&c1).unwrap();

        assert!(store.chat_exists(&c1.id).unwrap());
        assert_eq!(store.get_chat(&c1.id).unwrap(), c1);
    }

    #[test]
    fn members_do_not_leak_between_chats() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        store.create_chat(&chat("c1", "one", &["A", "B"])).unwrap();
        store.create_chat(&chat("c10", "ten", &["A", "C", "D"])).unwrap();

        let chats = store.list_chats().unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].peers.len(), 2);
        assert_eq!(chats[1].peers.len(), 3);
    }

    #[test]
    fn missing_chat_is_not_found() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        assert!(matches!(
            store.get_chat(&ChatId::from("nope")),
            Err(StoreError::NotFound)
        ));
    }
}
