//! Domain records persisted in the log store.
//!
//! Every struct derives `Serialize` and `Deserialize`; values are stored as
//! JSON under the key layout described in [`crate::keys`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{ChatId, MessageId, PeerIdentity};

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A known peer.  Created by explicit user action, never silently deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: PeerIdentity,
    /// Human-readable alias chosen by the local user.
    pub alias: String,
    /// Network address hints, most recently useful first.
    pub addresses: Vec<String>,
    /// Last time a session with this peer was opened.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(id: PeerIdentity, alias: impl Into<String>) -> Self {
        Self {
            id,
            alias: alias.into(),
            addresses: Vec::new(),
            last_seen: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// The persisted part of a chat under `chat:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatHeader {
    pub id: ChatId,
    pub name: String,
}

/// A chat header together with its (fixed) member set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    /// Every participant, including the local node.
    pub peers: BTreeSet<PeerIdentity>,
}

impl Chat {
    pub fn header(&self) -> ChatHeader {
        ChatHeader {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_member(&self, peer: &PeerIdentity) -> bool {
        self.peers.contains(peer)
    }

    /// Members other than `local`.
    pub fn others<'a>(&'a self, local: &'a PeerIdentity) -> impl Iterator<Item = &'a PeerIdentity> + 'a {
        self.peers.iter().filter(move |p| *p != local)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single immutable chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Previous message in the chain; `None` at chat genesis.
    pub prev: Option<MessageId>,
    pub chat_id: ChatId,
    pub author: PeerIdentity,
    pub text: String,
    /// Author's send time.
    pub sent: DateTime<Utc>,
}

impl Message {
    /// Send time as Unix nanoseconds, clamped to the representable range.
    pub fn sent_nanos(&self) -> i64 {
        self.sent.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0)
    }
}

// ---------------------------------------------------------------------------
// Bootstrap peer
// ---------------------------------------------------------------------------

/// Last known addresses of a routing peer, refreshed on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub id: PeerIdentity,
    pub addresses: Vec<String>,
}
