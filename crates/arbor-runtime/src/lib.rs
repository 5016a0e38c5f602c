//! Arbor Runtime - Peer state machine
//!
//! This crate drives the sync protocol for one replica:
//! - Local edits and their real-time push
//! - Hello / HelloBack handshake and catch-up
//! - Ack gossip and hub relaying
//! - Collapse scheduling and view refresh
//! - Per-peer event subscriptions
//!
//! A [`Peer`] is transport agnostic: it consumes [`arbor_wire::Message`]s
//! and queues [`Envelope`]s for whoever carries them.

pub mod config;
pub mod events;
pub mod logging;
pub mod peer;

pub use config::*;
pub use events::*;
pub use peer::*;
