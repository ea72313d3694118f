//! The node's own identity key.

use parley_shared::identity::Identity;

use crate::database::Store;
use crate::error::{Result, StoreError};
use crate::keys;

impl Store {
    /// Load the node key. [`StoreError::NotFound`] means this is a fresh store.
    pub fn load_node_key(&self) -> Result<Identity> {
        let bytes = self.get(keys::NODE_KEY)?;
        Ok(Identity::from_slice(&bytes)?)
    }

    pub fn save_node_key(&self, identity: &Identity) -> Result<()> {
        self.put(keys::NODE_KEY, identity.secret_bytes())
    }

    /// Load the node key, generating and persisting a new one on first run.
    pub fn load_or_create_node_key(&self) -> Result<Identity> {
        match self.load_node_key() {
            Ok(identity) => Ok(identity),
            Err(StoreError::NotFound) => {
                let identity = Identity::generate();
                self.save_node_key(&identity)?;
                tracing::info!(
                    public_key = %hex::encode(identity.public_key_bytes()),
                    "generated new node key"
                );
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::crypto::KdfParams;

    use super::*;

    const FAST: KdfParams = KdfParams {
        time_cost: 1,
        memory_kib: 64,
        parallelism: 1,
    };

    #[test]
    fn fresh_store_has_no_node_key() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        assert!(matches!(store.load_node_key(), Err(StoreError::NotFound)));
    }

    #[test]
    fn node_key_is_generated_once() {
        let store = Store::open_in_memory(Some("pw"), FAST).unwrap();
        let first = store.load_or_create_node_key().unwrap();
        let second = store.load_or_create_node_key().unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[test]
    fn truncated_node_key_is_an_identity_error() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        store.put(keys::NODE_KEY, &[1, 2, 3]).unwrap();
        assert!(matches!(store.load_node_key(), Err(StoreError::Identity(_))));
    }
}
