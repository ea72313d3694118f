//! Key layout of the log store.
//!
//! | key                                   | value                     |
//! |---------------------------------------|---------------------------|
//! | `system:node_key`                     | 32-byte Ed25519 secret    |
//! | `system:check`                        | passphrase canary         |
//! | `contact:{peer}`                      | JSON [`Contact`]          |
//! | `chat:{chat}`                         | JSON [`ChatHeader`]       |
//! | `member:{chat}:{peer}`                | empty                     |
//! | `msg:{chat}:{sent_ns:020}:{message}`  | JSON [`Message`]          |
//! | `boot:{peer}`                         | JSON address hints        |
//!
//! [`Contact`]: crate::models::Contact
//! [`ChatHeader`]: crate::models::ChatHeader
//! [`Message`]: crate::models::Message

use parley_shared::{ChatId, MessageId, PeerIdentity};

pub const NODE_KEY: &str = "system:node_key";
pub const CONTACT_PREFIX: &str = "contact:";
pub const CHAT_PREFIX: &str = "chat:";
pub const MEMBER_PREFIX: &str = "member:";
pub const MESSAGE_PREFIX: &str = "msg:";
pub const BOOT_PREFIX: &str = "boot:";

pub fn contact(id: &PeerIdentity) -> String {
    format!("{CONTACT_PREFIX}{id}")
}

pub fn chat(id: &ChatId) -> String {
    format!("{CHAT_PREFIX}{id}")
}

pub fn members_of(chat: &ChatId) -> String {
    format!("{MEMBER_PREFIX}{chat}:")
}

pub fn member(chat: &ChatId, peer: &PeerIdentity) -> String {
    format!("{}{peer}", members_of(chat))
}

pub fn messages_of(chat: &ChatId) -> String {
    format!("{MESSAGE_PREFIX}{chat}:")
}

/// The zero-padded timestamp makes lexicographic key order equal send order.
pub fn message(chat: &ChatId, sent_nanos: i64, id: &MessageId) -> String {
    format!("{}{:020}:{id}", messages_of(chat), sent_nanos.max(0))
}

pub fn boot(peer: &PeerIdentity) -> String {
    format!("{BOOT_PREFIX}{peer}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_keys_sort_by_time() {
        let chat = ChatId::from("c1");
        let early = message(&chat, 9, &MessageId::from("zzz"));
        let late = message(&chat, 10, &MessageId::from("aaa"));
        assert!(early < late);
        assert_eq!(early, "msg:c1:00000000000000000009:zzz");
    }

    #[test]
    fn member_key_layout() {
        let key = member(&ChatId::from("c1"), &PeerIdentity::from("B"));
        assert_eq!(key, "member:c1:B");
        assert!(key.starts_with(&members_of(&ChatId::from("c1"))));
    }
}
