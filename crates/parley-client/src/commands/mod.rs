//! Node operations, grouped by concern.  Each module adds an
//! `impl Orchestrator` block with the user-facing operations of its area and
//! the session callbacks that feed it.

pub mod contacts;
pub mod media;
pub mod messaging;
pub mod network;
