//! Node configuration loaded from environment variables.
//!
//! Every setting has a default, so a node starts with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{CALL_HEARTBEAT_SECS, DEFAULT_QUIC_PORT, PEER_LOOKUP_TIMEOUT_SECS};
use parley_store::Store;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the store.
    /// Env: `PARLEY_DATA_DIR`
    /// Default: the platform data directory for `parley`, or `./parley-data`.
    pub data_dir: PathBuf,

    /// QUIC listen port.
    /// Env: `PARLEY_PORT`
    /// Default: `4001`
    pub listen_port: u16,

    /// Optional file with one bootstrap multiaddr per line.
    /// Env: `PARLEY_BOOTSTRAP`
    pub bootstrap_file: Option<PathBuf>,

    /// Interval of the call presence heartbeat.
    pub heartbeat_interval: Duration,

    /// Upper bound of one peer address lookup.
    pub lookup_timeout: Duration,

    /// Pause before looking a contact up again after a failed lookup or a
    /// closed session.
    pub reconnect_delay: Duration,

    /// Enter calls without an outgoing stream when no capture device exists.
    pub allow_receive_only: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: Store::default_dir().unwrap_or_else(|_| PathBuf::from("./parley-data")),
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap_file: None,
            heartbeat_interval: Duration::from_secs(CALL_HEARTBEAT_SECS),
            lookup_timeout: Duration::from_secs(PEER_LOOKUP_TIMEOUT_SECS),
            reconnect_delay: Duration::from_secs(5),
            allow_receive_only: true,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(port) = std::env::var("PARLEY_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.listen_port = parsed,
                Err(_) => tracing::warn!(value = %port, "Invalid PARLEY_PORT, using default"),
            }
        }

        if let Ok(path) = std::env::var("PARLEY_BOOTSTRAP") {
            if !path.is_empty() {
                config.bootstrap_file = Some(PathBuf::from(path));
            }
        }

        // RUST_LOG is read by the tracing EnvFilter directly.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.lookup_timeout, Duration::from_secs(60));
        assert!(config.allow_receive_only);
        assert!(config.bootstrap_file.is_none());
    }
}
