use parley_shared::{CryptoError, IdentityError};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested key does not exist.  For the node key this is the
    /// signal to generate a fresh identity.
    #[error("Record not found")]
    NotFound,

    /// The passphrase does not open this store (or a passphrase was given
    /// for a plaintext store, or vice versa).
    #[error("Wrong passphrase for this store")]
    WrongPassphrase,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Value (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Value encryption failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Stored node key is malformed.
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// A key in the store does not have the expected layout.
    #[error("Malformed key: {0}")]
    MalformedKey(String),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
