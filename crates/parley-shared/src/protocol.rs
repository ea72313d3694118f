use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, MessageId, PeerIdentity};

/// All wire protocol packets exchanged between peers.
///
/// Exactly one variant travels per frame. The variant index is the wire tag,
/// so new variants must only ever be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPacket {
    /// Session liveness check
    Ping,

    /// Reply to [`DataPacket::Ping`]
    Pong,

    /// Ask a chat member to re-send a message we are missing
    ResendRequest(ResendRequest),

    /// A chat message, fresh or re-sent
    Message(ChatMessage),

    /// One encoded media chunk of a live call
    StreamChunk(StreamChunk),

    /// Call presence announcement
    StreamStatus(StreamStatusUpdate),

    /// Request to start or stop receiving a peer's stream
    StreamJoinResponse(StreamJoinResponse),
}

impl DataPacket {
    /// Short variant name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DataPacket::Ping => "ping",
            DataPacket::Pong => "pong",
            DataPacket::ResendRequest(_) => "resend_request",
            DataPacket::Message(_) => "message",
            DataPacket::StreamChunk(_) => "stream_chunk",
            DataPacket::StreamStatus(_) => "stream_status",
            DataPacket::StreamJoinResponse(_) => "stream_join_response",
        }
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRequest {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// A chat message as it travels on the wire.
///
/// Re-sent messages carry the original identifiers unchanged so the
/// receiver's chain is rebuilt exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub prev_message_id: Option<MessageId>,
    pub payload: Vec<u8>,
    pub author_id: PeerIdentity,
    pub mime_type: String,
    /// Author's send time, Unix nanoseconds
    pub sent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub chat_id: ChatId,
    pub seq: u64,
    pub is_init: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Active,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatusUpdate {
    pub chat_id: ChatId,
    pub status: StreamStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinAnswer {
    Enter,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamJoinResponse {
    pub chat_id: ChatId,
    pub answer: JoinAnswer,
}
