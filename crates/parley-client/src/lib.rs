//! Parley node: the session and protocol layer between the network fabric
//! and the user interface.
//!
//! [`Orchestrator`] is the entry point.  It accepts chat streams from a
//! [`parley_net::NetworkFabric`], runs one [`session::PeerSession`] per peer,
//! keeps chat logs causally ordered and drives the call signaling state.

pub mod bootstrap;
pub mod chat_log;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod session;
pub mod snapshot;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use events::{EventBus, NodeEvent};
pub use orchestrator::Orchestrator;
pub use snapshot::{ChatSummary, ChatView};

const DEFAULT_LOG_FILTER: &str = "parley_client=debug,parley_net=debug,parley_store=info,parley_media=info,warn";

/// Install the global tracing subscriber.  `RUST_LOG` overrides the default
/// filter.  Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
