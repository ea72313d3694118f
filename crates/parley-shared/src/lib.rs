//! Types, wire protocol and key material shared by every Parley crate.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, IdentityError, ProtocolError};
pub use protocol::DataPacket;
pub use types::{ChatId, MessageId, PeerIdentity};
