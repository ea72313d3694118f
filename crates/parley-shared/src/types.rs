use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Peer identity = textual form of the network-level peer id (derived from the
// node's Ed25519 public key by the fabric).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(pub String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last eight characters, which is where peer ids actually differ.
    pub fn short(&self) -> &str {
        let len = self.0.len();
        &self.0[len.saturating_sub(8)..]
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Longest chat or message id accepted from outside.
pub const MAX_ID_LEN: usize = 128;

/// Ids become store key segments separated by `:`, so they may not contain
/// one.
fn is_key_segment(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_ID_LEN && !id.chars().any(|c| c == ':' || c.is_control())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub String);

impl ChatId {
    /// Fresh id for an explicitly created group chat.
    pub fn new_group() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Deterministic id for the 1:1 chat between two peers. Both sides derive
    /// the same id regardless of who added whom first.
    pub fn direct(a: &PeerIdentity, b: &PeerIdentity) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new_derive_key(crate::constants::KDF_CONTEXT_DIRECT_CHAT);
        hasher.update(lo.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(hi.as_str().as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        is_key_segment(&self.0)
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        is_key_segment(&self.0)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
