use parley_media::MediaError;
use parley_net::NetError;
use parley_shared::{ChatId, PeerIdentity, ProtocolError};
use parley_store::StoreError;
use thiserror::Error;

/// Errors returned by node operations.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Contact {0} already exists")]
    ContactExists(PeerIdentity),

    #[error("Unknown contact {0}")]
    UnknownContact(PeerIdentity),

    #[error("Unknown chat {0}")]
    UnknownChat(ChatId),

    #[error("No chat selected")]
    NoChatSelected,

    #[error("Not in a call")]
    NotInCall,

    #[error("No session with {0}")]
    NotConnected(PeerIdentity),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Node is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, NodeError>;
