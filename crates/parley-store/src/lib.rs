//! # parley-store
//!
//! The persistent log store: an ordered key-value table in SQLite whose
//! values are sealed with a passphrase-derived key.  Typed helpers for each
//! record kind live in their own module as `impl Store` blocks.

pub mod bootstrap;
pub mod chats;
pub mod contacts;
pub mod database;
pub mod keys;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod system;

mod error;

pub use database::Store;
pub use error::{Result, StoreError};
pub use models::*;
