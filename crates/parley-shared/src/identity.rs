use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::error::IdentityError;

/// The node's long-term Ed25519 keypair.
///
/// The network fabric derives the node's peer identity from the public half;
/// the secret half is what the store keeps under `system:node_key`.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore identity from a stored byte slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}
