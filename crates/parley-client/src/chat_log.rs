//! In-memory chat log.
//!
//! Messages live in an append-only arena indexed by id.  A message whose
//! `prev` is unknown waits in the gap buffer, keyed by the id it waits for,
//! until that message is appended.  The gap buffer is bounded in size and
//! age; anything it drops comes back with the next leaf announcement.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

use parley_shared::{MessageId, PeerIdentity};
use parley_store::{Chat, Message};

/// How an arriving message relates to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Already appended or already waiting.
    Duplicate,
    /// `prev` is null or known; the message can be appended.
    Ready,
    /// `prev` is not in the log yet.
    MissingPrev(MessageId),
}

/// Held messages per chat.
pub const MAX_WAITING: usize = 512;

/// A missing id nobody answered for this long is given up.
pub const WAIT_EXPIRY: Duration = Duration::from_secs(600);

struct WaitSlot {
    since: Instant,
    held: Vec<Message>,
}

pub struct ChatLog {
    chat: Chat,
    /// Peer order used for call tiles and resend fallbacks.
    order: Vec<PeerIdentity>,
    loaded: bool,
    entries: Vec<Message>,
    index: HashMap<MessageId, usize>,
    waiting: HashMap<MessageId, WaitSlot>,
    waiting_ids: HashSet<MessageId>,
    /// Ids some appended message names as `prev`.
    referenced: HashSet<MessageId>,
    head: Option<usize>,
}

impl ChatLog {
    pub fn new(chat: Chat) -> Self {
        let order = chat.peers.iter().cloned().collect();
        Self {
            chat,
            order,
            loaded: false,
            entries: Vec::new(),
            index: HashMap::new(),
            waiting: HashMap::new(),
            waiting_ids: HashSet::new(),
            referenced: HashSet::new(),
            head: None,
        }
    }

    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Merge persisted history into the arena.
    pub fn load(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.append(message);
        }
        self.loaded = true;
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Latest message by send time.
    pub fn head(&self) -> Option<&Message> {
        self.head.map(|i| &self.entries[i])
    }

    /// Tips of every branch: messages no other message names as `prev`.
    /// Concurrent sends fork the chain, so there can be several.
    pub fn leaves(&self) -> Vec<&Message> {
        let mut leaves: Vec<&Message> = self
            .entries
            .iter()
            .filter(|m| !self.referenced.contains(&m.id))
            .collect();
        leaves.sort_by(|a, b| (a.sent, &a.id).cmp(&(b.sent, &b.id)));
        leaves
    }

    pub fn classify(&self, message: &Message) -> Arrival {
        if self.contains(&message.id) || self.waiting_ids.contains(&message.id) {
            return Arrival::Duplicate;
        }
        match &message.prev {
            Some(prev) if !self.contains(prev) => Arrival::MissingPrev(prev.clone()),
            _ => Arrival::Ready,
        }
    }

    /// Add a message to the arena.  Returns `false` for a known id.
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let idx = self.entries.len();
        let newer = self
            .head()
            .map_or(true, |head| (message.sent, &message.id) > (head.sent, &head.id));
        self.index.insert(message.id.clone(), idx);
        if let Some(prev) = &message.prev {
            self.referenced.insert(prev.clone());
        }
        self.entries.push(message);
        if newer {
            self.head = Some(idx);
        }
        true
    }

    /// Park a message until its `prev` arrives.  Returns `false` if it was
    /// already waiting or the gap buffer is full.
    pub fn hold(&mut self, message: Message) -> bool {
        self.hold_at(message, Instant::now())
    }

    pub fn hold_at(&mut self, message: Message, now: Instant) -> bool {
        let Some(prev) = message.prev.clone() else {
            return false;
        };
        self.expire(now);
        if self.waiting_ids.contains(&message.id) || self.waiting_ids.len() >= MAX_WAITING {
            return false;
        }
        self.waiting_ids.insert(message.id.clone());
        self.waiting
            .entry(prev)
            .or_insert_with(|| WaitSlot { since: now, held: Vec::new() })
            .held
            .push(message);
        true
    }

    /// Record `id` as missing with nothing held behind it yet, so it is
    /// asked for again on the next session.
    pub fn mark_missing(&mut self, id: MessageId) {
        if self.contains(&id) {
            return;
        }
        self.waiting.entry(id).or_insert_with(|| WaitSlot {
            since: Instant::now(),
            held: Vec::new(),
        });
    }

    /// Take the messages that were waiting for `id`.
    pub fn release(&mut self, id: &MessageId) -> Vec<Message> {
        let released = self.waiting.remove(id).map(|slot| slot.held).unwrap_or_default();
        for message in &released {
            self.waiting_ids.remove(&message.id);
        }
        released
    }

    /// Drop gaps older than [`WAIT_EXPIRY`].  Returns how many held
    /// messages went with them.
    pub fn expire(&mut self, now: Instant) -> usize {
        let stale: Vec<MessageId> = self
            .waiting
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.since) >= WAIT_EXPIRY)
            .map(|(id, _)| id.clone())
            .collect();
        let mut dropped = 0;
        for id in stale {
            dropped += self.release(&id).len();
        }
        dropped
    }

    /// Ids we are waiting for, oldest gap first.
    pub fn missing(&self) -> Vec<MessageId> {
        let mut missing: Vec<(&Instant, &MessageId)> = self.waiting.iter().map(|(id, slot)| (&slot.since, id)).collect();
        missing.sort();
        missing.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_ids.len()
    }

    /// Messages in display order.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = self.entries.clone();
        messages.sort_by(|a, b| (a.sent, &a.id).cmp(&(b.sent, &b.id)));
        messages
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peer_order(&self) -> &[PeerIdentity] {
        &self.order
    }

    pub fn shuffle_peers<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.order.shuffle(rng);
    }
}
