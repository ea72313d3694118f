//! Last-known routing peers, used to reconnect faster on the next run.

use parley_shared::PeerIdentity;

use crate::database::Store;
use crate::error::Result;
use crate::keys;
use crate::models::BootstrapPeer;

impl Store {
    /// Replace the stored bootstrap set with `peers`.
    pub fn save_bootstrap_peers(&self, peers: &[BootstrapPeer]) -> Result<()> {
        let entries = peers
            .iter()
            .map(|peer| -> Result<(String, Vec<u8>)> {
                Ok((keys::boot(&peer.id), serde_json::to_vec(&peer.addresses)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.replace_prefix(keys::BOOT_PREFIX, &entries)?;
        tracing::debug!(count = peers.len(), "saved bootstrap peers");
        Ok(())
    }

    pub fn load_bootstrap_peers(&self) -> Result<Vec<BootstrapPeer>> {
        self.scan_prefix(keys::BOOT_PREFIX)?
            .into_iter()
            .filter_map(|(key, value)| {
                let id = PeerIdentity::from(key.strip_prefix(keys::BOOT_PREFIX)?);
                Some((id, value))
            })
            .map(|(id, value)| -> Result<BootstrapPeer> {
                Ok(BootstrapPeer {
                    id,
                    addresses: serde_json::from_slice(&value)?,
                })
            })
            .collect()
    }
}
