//! # parley-store
//!
//! SQLite-backed store for the messaging subsystem: channels and their
//! memberships, the per-channel append-only message log, notification rows
//! (both per-recipient fan-out and role broadcast), and the denormalized
//! unread/read-state counters.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every domain
//! model. All multi-row mutations run inside a transaction on the single
//! connection, which is what the ordering and unread-count invariants lean
//! on.

pub mod channels;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod read_state;
pub mod users;

mod error;

#[cfg(test)]
pub(crate) mod test_support;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
