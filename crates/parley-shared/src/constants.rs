/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Stream protocol tag for chat and call frames
pub const CHAT_PROTOCOL: &str = "/parley/chat/1.0.0";

/// Application name, also used for the data directory
pub const APP_NAME: &str = "parley";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum frame payload on a peer stream (20 KiB)
pub const MAX_FRAME_SIZE: usize = 20 * 1024;

/// Call presence heartbeat interval in seconds
pub const CALL_HEARTBEAT_SECS: u64 = 5;

/// Upper bound for a single peer address lookup, in seconds
pub const PEER_LOOKUP_TIMEOUT_SECS: u64 = 60;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// MIME type of plain chat text
pub const MIME_TEXT: &str = "text/plain";

/// Fixed salt for the store key schedule. The passphrase is the only secret.
pub const STORE_KDF_SALT: &[u8] = b"parley-store-salt-v1";

/// Argon2id parameters for the store key (t=1, m=64 MiB, p=4)
pub const STORE_KDF_TIME_COST: u32 = 1;
pub const STORE_KDF_MEMORY_KIB: u32 = 64 * 1024;
pub const STORE_KDF_PARALLELISM: u32 = 4;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_DIRECT_CHAT: &str = "parley-direct-chat-id-v1";
