//! Chat messages, keyed so that a prefix scan yields send order.

use parley_shared::{ChatId, MessageId};

use crate::database::Store;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::models::Message;

impl Store {
    /// Persist a message. Re-inserting the same message is idempotent.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let key = keys::message(&message.chat_id, message.sent_nanos(), &message.id);
        self.put_json(&key, message)
    }

    /// All messages of a chat in sent-time order.
    pub fn list_messages(&self, chat: &ChatId) -> Result<Vec<Message>> {
        self.scan_prefix(&keys::messages_of(chat))?
            .into_iter()
            .map(|(_, value)| -> Result<Message> { Ok(serde_json::from_slice(&value)?) })
            .collect()
    }

    /// The most recently sent message of a chat.
    pub fn last_message(&self, chat: &ChatId) -> Result<Option<Message>> {
        match self.last_with_prefix(&keys::messages_of(chat))? {
            Some((_, value)) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Look a message up by id. Only keys are scanned; one value is decrypted.
    pub fn find_message(&self, chat: &ChatId, id: &MessageId) -> Result<Message> {
        let prefix = keys::messages_of(chat);
        let key = self
            .scan_prefix_keys(&prefix)?
            .into_iter()
            .find(|key| {
                key.strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.split_once(':'))
                    .is_some_and(|(_, message)| message == id.as_str())
            })
            .ok_or(StoreError::NotFound)?;
        self.get_json(&key)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use parley_shared::crypto::KdfParams;
    use parley_shared::PeerIdentity;

    use super::*;

    const FAST: KdfParams = KdfParams {
        time_cost: 1,
        memory_kib: 64,
        parallelism: 1,
    };

    fn message(id: &str, prev: Option<&str>, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            prev: prev.map(MessageId::from),
            chat_id: ChatId::from("c1"),
            author: PeerIdentity::from("A"),
            text: format!("text of {id}"),
            sent: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs),
        }
    }

    #[test]
    fn listing_follows_sent_time_not_insert_order() {
        let store = Store::open_in_memory(Some("pw"), FAST).unwrap();
        store.insert_message(&message("m2", Some("m1"), 2)).unwrap();
        store.insert_message(&message("m1", None, 1)).unwrap();
        store.insert_message(&message("m3", Some("m2"), 3)).unwrap();

        let ids: Vec<_> = store
            .list_messages(&ChatId::from("c1"))
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let last = store.last_message(&ChatId::from("c1")).unwrap().unwrap();
        assert_eq!(last.id, MessageId::from("m3"));
    }

    #[test]
    fn find_by_id() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        let m1 = message("m1", None, 1);
        store.insert_message(&m1).unwrap();
        store.insert_message(&message("m11", Some("m1"), 2)).unwrap();

        assert_eq!(store.find_message(&m1.chat_id, &m1.id).unwrap(), m1);
        assert!(matches!(
            store.find_message(&m1.chat_id, &MessageId::from("m4")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn find_matches_the_whole_id_only() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        let m1 = message("m1", None, 1);
        store.insert_message(&m1).unwrap();

        let tail_of_key = MessageId::from(format!("{:020}:m1", m1.sent_nanos()).as_str());
        assert!(matches!(
            store.find_message(&m1.chat_id, &tail_of_key),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.find_message(&m1.chat_id, &MessageId::from("1")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn reinsert_does_not_duplicate() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        let m1 = message("m1", None, 1);
        store.insert_message(&m1).unwrap();
        store.insert_message(&m1).unwrap();
        assert_eq!(store.list_messages(&m1.chat_id).unwrap().len(), 1);
    }

    #[test]
    fn empty_chat_has_no_last_message() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        assert!(store.last_message(&ChatId::from("c1")).unwrap().is_none());
    }
}
