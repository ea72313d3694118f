use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{
    NONCE_SIZE, STORE_KDF_MEMORY_KIB, STORE_KDF_PARALLELISM, STORE_KDF_SALT, STORE_KDF_TIME_COST,
    SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Argon2id cost parameters for the store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub time_cost: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: STORE_KDF_TIME_COST,
            memory_kib: STORE_KDF_MEMORY_KIB,
            parallelism: STORE_KDF_PARALLELISM,
        }
    }
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Memory-hard store key from the user's passphrase over the fixed salt.
pub fn derive_store_key(passphrase: &[u8], params: KdfParams) -> Result<SymmetricKey, CryptoError> {
    let params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(SYMMETRIC_KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    argon
        .hash_password_into(passphrase, STORE_KDF_SALT, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}
