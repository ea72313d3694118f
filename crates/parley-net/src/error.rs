use thiserror::Error;

/// Errors produced by the network fabric.
#[derive(Error, Debug)]
pub enum NetError {
    /// Swarm construction or listen failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer id string is not a valid network peer id.
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// A dial attempt failed.
    #[error("Failed to dial {peer}: {reason}")]
    Dial { peer: String, reason: String },

    /// Opening a protocol stream failed.
    #[error("Failed to open stream to {peer}: {reason}")]
    OpenStream { peer: String, reason: String },

    /// The protocol already has an inbound stream handler.
    #[error("Protocol {0} already has a stream handler")]
    AlreadyRegistered(String),

    /// A peer lookup did not complete within its deadline.
    #[error("Lookup for {0} timed out")]
    LookupTimeout(String),

    /// The swarm task has stopped.
    #[error("Network task is not running")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
